//! In-process simulation plugins for CI/CD testing without physical hardware.
//!
//! [`SimRegistry`] builds a [`PluginRegistry`] pre-populated with
//! [`SimActionPlugin`]s that record every command they execute.  The
//! [`ScriptedInput`] and [`SimCamera`] sources emit canned observations at a
//! fixed pace.  Together they let the full agent loop run headless.
//!
//! # Example
//!
//! ```rust
//! use ember_hal::sim::SimRegistry;
//!
//! let (registry, log) = SimRegistry::new()
//!     .with_speaker()
//!     .with_drive_base()
//!     .build();
//!
//! assert!(registry.contains("speaker"));
//! assert!(log.lock().unwrap().is_empty());
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ember_types::{ActionCommand, CommandSummary, EmberError, ImageFrame, ObservationPayload};
use tracing::info;

use crate::action::ActionPlugin;
use crate::camera::Camera;
use crate::input::InputPlugin;
use crate::registry::PluginRegistry;

/// Shared log of `(plugin_id, command)` pairs executed by sim plugins.
pub type CommandLog = Arc<Mutex<Vec<(String, CommandSummary)>>>;

// ────────────────────────────────────────────────────────────────────────────
// Simulated action plugin
// ────────────────────────────────────────────────────────────────────────────

/// How a [`SimActionPlugin`] responds to `execute`.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Acknowledge after `latency`.
    Succeed { latency: Duration },
    /// Fail with the given detail.
    Fail(String),
    /// Never return.  The caller's timeout must fire.
    Hang,
}

/// A simulated actuator sink that records every command it executes.
pub struct SimActionPlugin {
    id: String,
    actions: Option<BTreeSet<String>>,
    behavior: SimBehavior,
    healthy: Arc<AtomicBool>,
    log: CommandLog,
}

impl SimActionPlugin {
    /// A plugin that accepts any action and succeeds immediately.
    pub fn new(id: impl Into<String>, log: CommandLog) -> Self {
        Self {
            id: id.into(),
            actions: None,
            behavior: SimBehavior::Succeed {
                latency: Duration::ZERO,
            },
            healthy: Arc::new(AtomicBool::new(true)),
            log,
        }
    }

    /// Restrict the plugin to the listed action names.
    pub fn supporting(mut self, actions: &[&str]) -> Self {
        self.actions = Some(actions.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn with_behavior(mut self, behavior: SimBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Handle for toggling health from a test.
    pub fn health_handle(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }
}

#[async_trait]
impl ActionPlugin for SimActionPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, action_name: &str) -> bool {
        self.actions
            .as_ref()
            .is_none_or(|set| set.contains(action_name))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &ActionCommand,
        timeout: Duration,
    ) -> Result<String, EmberError> {
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((self.id.clone(), command.summary()));
        match &self.behavior {
            SimBehavior::Succeed { latency } => {
                if *latency > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(EmberError::DispatchTimeout {
                        target: self.id.clone(),
                        after: timeout,
                    });
                }
                if !latency.is_zero() {
                    tokio::time::sleep(*latency).await;
                }
                info!(plugin = %self.id, command = %command, "sim executed");
                Ok(format!("sim:{} executed {}", self.id, command.action_name()))
            }
            SimBehavior::Fail(detail) => Err(EmberError::DispatchFailure {
                target: self.id.clone(),
                details: detail.clone(),
            }),
            SimBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(String::new())
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated inputs
// ────────────────────────────────────────────────────────────────────────────

/// Emits the next payload from a fixed script every `interval`, cycling.
/// An empty script makes every acquisition fail, which is how tests model a
/// source that never produces data.
pub struct ScriptedInput {
    source_id: String,
    interval: Duration,
    script: Vec<ObservationPayload>,
    cursor: usize,
}

impl ScriptedInput {
    pub fn new(
        source_id: impl Into<String>,
        interval: Duration,
        script: Vec<ObservationPayload>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            interval,
            script,
            cursor: 0,
        }
    }

    /// A source that is never reachable.
    pub fn offline(source_id: impl Into<String>) -> Self {
        Self::new(source_id, Duration::from_millis(100), Vec::new())
    }
}

#[async_trait]
impl InputPlugin for ScriptedInput {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn min_interval(&self) -> Duration {
        self.interval
    }

    async fn acquire(&mut self) -> Result<Option<ObservationPayload>, EmberError> {
        if self.script.is_empty() {
            return Err(EmberError::InputUnavailable {
                source_id: self.source_id.clone(),
                reason: "simulated source offline".to_string(),
            });
        }
        let payload = self.script[self.cursor % self.script.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(Some(payload))
    }
}

/// A simulated camera returning a blank frame with a fixed description.
pub struct SimCamera {
    id: String,
    description: String,
}

impl SimCamera {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<ImageFrame, EmberError> {
        Ok(ImageFrame {
            width: 4,
            height: 4,
            encoding: "mono8".to_string(),
            description: Some(self.description.clone()),
            data: vec![0u8; 16],
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder that constructs a [`PluginRegistry`] pre-populated with simulated
/// action plugins sharing one [`CommandLog`].
#[derive(Default)]
pub struct SimRegistry {
    log: CommandLog,
    plugins: Vec<Arc<dyn ActionPlugin>>,
}

impl SimRegistry {
    /// Create an empty [`SimRegistry`] builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The log every plugin created by this builder writes to.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Register a simulated `"speaker"` supporting `speak`.
    pub fn with_speaker(self) -> Self {
        let plugin = SimActionPlugin::new("speaker", self.log.clone()).supporting(&["speak"]);
        self.with_plugin(Arc::new(plugin))
    }

    /// Register a simulated `"base"` supporting `move` and `stop`.
    pub fn with_drive_base(self) -> Self {
        let plugin =
            SimActionPlugin::new("base", self.log.clone()).supporting(&["move", "stop"]);
        self.with_plugin(Arc::new(plugin))
    }

    /// Register a simulated plugin with the given id and behaviour.
    pub fn with_sim(self, id: &str, behavior: SimBehavior) -> Self {
        let plugin = SimActionPlugin::new(id, self.log.clone()).with_behavior(behavior);
        self.with_plugin(Arc::new(plugin))
    }

    /// Register any plugin.
    pub fn with_plugin(mut self, plugin: Arc<dyn ActionPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Consume the builder and return the registry plus its command log.
    pub fn build(self) -> (PluginRegistry, CommandLog) {
        let mut registry = PluginRegistry::new();
        for p in self.plugins {
            registry.register(p);
        }
        (registry, self.log)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use ember_types::{ActionDefinition, ActionVocabulary, CandidateArg, ParamKind, ParamSpec, ParamValue};

    use super::*;

    fn speak_command(text: &str) -> ActionCommand {
        let vocab = ActionVocabulary::new(vec![ActionDefinition {
            name: "speak".into(),
            description: String::new(),
            params: vec![ParamSpec {
                name: "text".into(),
                kind: ParamKind::String { max_len: None },
                required: true,
                description: None,
            }],
            target: "speaker".into(),
            idempotent: false,
        }])
        .unwrap();
        vocab
            .bind(
                1,
                "speak",
                vec![CandidateArg {
                    name: None,
                    value: ParamValue::String(text.into()),
                }],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn sim_plugin_records_commands() {
        let (registry, log) = SimRegistry::new().with_speaker().build();
        let speaker = registry.get("speaker").unwrap();
        assert!(speaker.supports("speak"));
        assert!(!speaker.supports("move"));

        let ack = speaker
            .execute(&speak_command("hello"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ack.contains("speak"));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "speaker");
        assert_eq!(log[0].1.action_name, "speak");
    }

    #[tokio::test]
    async fn failing_sim_plugin_returns_dispatch_failure() {
        let (registry, _log) = SimRegistry::new()
            .with_sim("speaker", SimBehavior::Fail("amp overheated".into()))
            .build();
        let err = registry
            .get("speaker")
            .unwrap()
            .execute(&speak_command("hi"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::DispatchFailure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_sim_plugin_never_returns() {
        let (registry, _log) = SimRegistry::new().with_sim("speaker", SimBehavior::Hang).build();
        let plugin = registry.get("speaker").unwrap();
        let cmd = speak_command("hi");
        let call = plugin.execute(&cmd, Duration::from_secs(1));
        let res = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sim_plugin_gives_up_within_its_budget() {
        let (registry, log) = SimRegistry::new()
            .with_sim("speaker", SimBehavior::Succeed { latency: Duration::from_millis(500) })
            .build();
        let plugin = registry.get("speaker").unwrap();
        let started = tokio::time::Instant::now();
        let err = plugin
            .execute(&speak_command("hi"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::DispatchTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn health_handle_toggles_availability() {
        let log = CommandLog::default();
        let plugin = SimActionPlugin::new("arm", log);
        let health = plugin.health_handle();
        let (registry, _) = SimRegistry::new().with_plugin(Arc::new(plugin)).build();
        assert!(registry.is_available("arm", "grip"));
        health.store(false, Ordering::SeqCst);
        assert!(!registry.is_available("arm", "grip"));
    }

    #[tokio::test]
    async fn scripted_input_cycles_and_offline_fails() {
        let mut input = ScriptedInput::new(
            "mic",
            Duration::from_millis(10),
            vec![
                ObservationPayload::Text { text: "a".into() },
                ObservationPayload::Text { text: "b".into() },
            ],
        );
        let seq: Vec<_> = [
            input.acquire().await.unwrap(),
            input.acquire().await.unwrap(),
            input.acquire().await.unwrap(),
        ]
        .into_iter()
        .flatten()
        .collect();
        assert_eq!(seq[0], ObservationPayload::Text { text: "a".into() });
        assert_eq!(seq[2], ObservationPayload::Text { text: "a".into() });

        let mut offline = ScriptedInput::offline("lidar");
        assert!(offline.acquire().await.is_err());
    }

    #[test]
    fn sim_camera_returns_described_blank_frame() {
        let mut cam = SimCamera::new("front", "an empty hallway");
        let frame = cam.capture().unwrap();
        assert_eq!(frame.width, 4);
        assert!(frame.data.iter().all(|&b| b == 0));
        assert_eq!(frame.description.as_deref(), Some("an empty hallway"));
    }
}
