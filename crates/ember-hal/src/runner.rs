//! [`InputRunner`] – drives one [`InputPlugin`] on its own task.
//!
//! Each runner owns exactly one source.  It paces acquisitions by the
//! plugin's `min_interval`, stamps every payload with a monotonic capture
//! time and per-source sequence number, and publishes the resulting
//! [`Observation`] into a shared [`ObservationSink`].  Failures never
//! propagate: the runner marks the source degraded and backs off.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut runner = InputRunner::new(Box::new(camera), table.clone(), BackoffConfig::default());
//! runner.start()?;
//! // ... ticks read the table ...
//! runner.stop().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use ember_types::{EmberError, Observation};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::input::{InputPlugin, ObservationSink};

/// Floor on pacing so a plugin with no data and no interval cannot spin.
const MIN_POLL: Duration = Duration::from_millis(1);

type Latest = Option<Arc<Observation>>;

/// Owns one input plugin and the task acquiring from it.
pub struct InputRunner {
    source_id: String,
    plugin: Option<Box<dyn InputPlugin>>,
    sink: Arc<dyn ObservationSink>,
    backoff: BackoffConfig,
    latest_tx: Arc<watch::Sender<Latest>>,
    latest_rx: watch::Receiver<Latest>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Box<dyn InputPlugin>>>,
}

impl InputRunner {
    pub fn new(
        plugin: Box<dyn InputPlugin>,
        sink: Arc<dyn ObservationSink>,
        backoff: BackoffConfig,
    ) -> Self {
        let (latest_tx, latest_rx) = watch::channel(None);
        Self {
            source_id: plugin.source_id().to_string(),
            plugin: Some(plugin),
            sink,
            backoff,
            latest_tx: Arc::new(latest_tx),
            latest_rx,
            shutdown: None,
            task: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the acquisition task.  Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::Configuration`] if the runner is already started.
    pub fn start(&mut self) -> Result<(), EmberError> {
        let plugin = self.plugin.take().ok_or_else(|| {
            EmberError::Configuration(format!("input '{}' already started", self.source_id))
        })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_source(
            plugin,
            self.sink.clone(),
            self.latest_tx.clone(),
            shutdown_rx,
            self.backoff,
        ));
        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        info!(source = %self.source_id, "input runner started");
        Ok(())
    }

    /// Stop the acquisition task and wait for it to exit.  The plugin is
    /// kept so the runner can be started again.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(plugin) => self.plugin = Some(plugin),
                Err(e) => warn!(source = %self.source_id, error = %e, "input task ended abnormally"),
            }
            info!(source = %self.source_id, "input runner stopped");
        }
    }

    /// Most recent observation from this source, or `None` if it never
    /// produced one.
    pub fn latest(&self) -> Option<Arc<Observation>> {
        self.latest_rx.borrow().clone()
    }
}

impl Drop for InputRunner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_source(
    mut plugin: Box<dyn InputPlugin>,
    sink: Arc<dyn ObservationSink>,
    latest: Arc<watch::Sender<Latest>>,
    mut shutdown: watch::Receiver<bool>,
    backoff: BackoffConfig,
) -> Box<dyn InputPlugin> {
    let source_id = plugin.source_id().to_string();
    let min_interval = plugin.min_interval();
    let mut backoff = Backoff::new(backoff);
    let mut sequence = 0u64;

    loop {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            r = plugin.acquire() => r,
        };

        let pause = match result {
            Ok(Some(payload)) => {
                sequence += 1;
                let observation = Arc::new(Observation {
                    source_id: source_id.clone(),
                    captured_at: Instant::now(),
                    sequence,
                    payload,
                });
                if backoff.failures() > 0 {
                    info!(source = %source_id, failures = backoff.failures(), "input source recovered");
                    sink.mark_healthy(&source_id);
                    backoff.reset();
                }
                debug!(source = %source_id, sequence, kind = observation.payload.kind(), "observation");
                sink.publish(observation.clone());
                latest.send_replace(Some(observation));
                min_interval.saturating_sub(started.elapsed()).max(MIN_POLL)
            }
            Ok(None) => min_interval.saturating_sub(started.elapsed()).max(MIN_POLL),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    source = %source_id,
                    failures = backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "input acquisition failed"
                );
                sink.mark_degraded(&source_id, &e.to_string(), backoff.failures());
                delay
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep(pause) => {}
        }
    }
    plugin
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ember_types::ObservationPayload;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<Arc<Observation>>>,
        degraded: Mutex<Vec<u32>>,
        healthy: Mutex<u32>,
    }

    impl ObservationSink for RecordingSink {
        fn publish(&self, observation: Arc<Observation>) {
            self.published.lock().unwrap().push(observation);
        }
        fn mark_degraded(&self, _source_id: &str, _reason: &str, failures: u32) {
            self.degraded.lock().unwrap().push(failures);
        }
        fn mark_healthy(&self, _source_id: &str) {
            *self.healthy.lock().unwrap() += 1;
        }
    }

    /// Fails `failures` times, then yields text forever.
    struct Flaky {
        failures: u32,
    }

    #[async_trait]
    impl InputPlugin for Flaky {
        fn source_id(&self) -> &str {
            "flaky"
        }
        fn min_interval(&self) -> Duration {
            Duration::from_millis(50)
        }
        async fn acquire(&mut self) -> Result<Option<ObservationPayload>, EmberError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(EmberError::InputUnavailable {
                    source_id: "flaky".into(),
                    reason: "unplugged".into(),
                });
            }
            Ok(Some(ObservationPayload::Text { text: "ok".into() }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paces_by_min_interval_and_numbers_observations() {
        let sink = Arc::new(RecordingSink::default());
        let mut runner = InputRunner::new(
            Box::new(Flaky { failures: 0 }),
            sink.clone(),
            BackoffConfig::default(),
        );
        assert!(runner.latest().is_none());
        runner.start().unwrap();

        tokio::time::sleep(Duration::from_millis(175)).await;
        runner.stop().await;

        let published = sink.published.lock().unwrap();
        // t = 0, 50, 100, 150
        assert_eq!(published.len(), 4);
        assert_eq!(published.last().unwrap().sequence, 4);
        assert_eq!(runner.latest().unwrap().sequence, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_recover() {
        let sink = Arc::new(RecordingSink::default());
        let mut runner = InputRunner::new(
            Box::new(Flaky { failures: 2 }),
            sink.clone(),
            BackoffConfig {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
        );
        runner.start().unwrap();

        // Failures at t=0 (wait 100) and t=100 (wait 200); success at t=300.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*sink.degraded.lock().unwrap(), vec![1, 2]);
        assert!(sink.published.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*sink.healthy.lock().unwrap(), 1);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
        runner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected_and_restart_after_stop_works() {
        let sink = Arc::new(RecordingSink::default());
        let mut runner =
            InputRunner::new(Box::new(Flaky { failures: 0 }), sink, BackoffConfig::default());
        runner.start().unwrap();
        assert!(runner.start().is_err());
        runner.stop().await;
        assert!(!runner.is_running());
        runner.start().unwrap();
        assert!(runner.is_running());
        runner.stop().await;
    }
}
