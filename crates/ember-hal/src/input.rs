//! Input Plugin capability.
//!
//! An [`InputPlugin`] wraps one data source (camera, microphone, LIDAR,
//! social feed, …).  It never talks to the Fuser directly: an
//! [`InputRunner`](crate::runner::InputRunner) drives it on its own task and
//! publishes each result into an [`ObservationSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_types::{EmberError, Observation, ObservationPayload};

/// Pacing used when a plugin does not declare its own.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// One observation source.
#[async_trait]
pub trait InputPlugin: Send {
    /// Stable identifier for this source, e.g. `"front_camera"`.
    fn source_id(&self) -> &str;

    /// Minimum spacing between two acquisitions.
    fn min_interval(&self) -> Duration {
        DEFAULT_MIN_INTERVAL
    }

    /// Acquire the next reading.
    ///
    /// `Ok(None)` means the source is reachable but had nothing new.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::InputUnavailable`] when the source cannot be
    /// reached.  The runner marks the source degraded and backs off.
    async fn acquire(&mut self) -> Result<Option<ObservationPayload>, EmberError>;
}

/// Destination for observations and health changes, implemented by the
/// latest-observation table.
pub trait ObservationSink: Send + Sync {
    /// Replace the latest observation for its source (last writer wins).
    fn publish(&self, observation: Arc<Observation>);

    /// Record that a source's acquisitions are failing.
    fn mark_degraded(&self, source_id: &str, reason: &str, consecutive_failures: u32);

    /// Record that a previously degraded source is producing again.
    fn mark_healthy(&self, source_id: &str);
}
