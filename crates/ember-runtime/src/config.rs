//! Agent configuration: the immutable struct every component is built from.
//!
//! Lifecycle: load (TOML) → [`AgentConfig::validate`] → construct → run.
//! A configuration that fails validation is fatal; the agent refuses to
//! start.
//!
//! # Example
//!
//! ```toml
//! name = "greeter"
//! persona = "You are a friendly lobby robot."
//!
//! [timing]
//! tick_interval_ms = 500
//! tick_deadline_ms = 2000
//! inference_timeout_ms = 1500
//!
//! [inference]
//! base_url = "http://localhost:11434"
//! model = "llama3"
//!
//! [[inputs]]
//! id = "asr"
//! kind = "scripted"
//! texts = ["hello robot"]
//!
//! [[plugins]]
//! id = "speaker"
//! kind = "sim"
//!
//! [[actions]]
//! name = "speak"
//! description = "Say something out loud"
//! target = "speaker"
//! params = [{ name = "text", kind = { type = "string", max_len = 200 } }]
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use ember_kernel::ParamRangeRule;
use ember_types::{ActionDefinition, ActionVocabulary, EmberError};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// ─────────────────────────────────────────────────────────────────────────────
// Top level
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// System instructions prepended to every prompt.
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub inference: EndpointConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub safety: SafetyConfig,
}

fn default_name() -> String {
    "ember".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            persona: String::new(),
            timing: TimingConfig::default(),
            fusion: FusionConfig::default(),
            prompt: PromptConfig::default(),
            inference: EndpointConfig::default(),
            telemetry: TelemetryConfig::default(),
            inputs: Vec::new(),
            plugins: Vec::new(),
            actions: Vec::new(),
            safety: SafetyConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Cadence, deadlines, timeouts, and retry limits.  All values in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_interval_ms: u64,
    /// Hard cap on one tick, from fuse to the end of dispatch.
    pub tick_deadline_ms: u64,
    pub inference_timeout_ms: u64,
    /// Extra attempts after a transient inference failure.
    pub inference_retries: u32,
    pub inference_backoff_ms: u64,
    pub dispatch_timeout_ms: u64,
    /// Upper bound on executions of an idempotent action.  Non-idempotent
    /// actions always run at most once.
    pub dispatch_attempts: u32,
    pub input_backoff_base_ms: u64,
    pub input_backoff_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            tick_deadline_ms: 4000,
            inference_timeout_ms: 3000,
            inference_retries: 1,
            inference_backoff_ms: 250,
            dispatch_timeout_ms: 1000,
            dispatch_attempts: 2,
            input_backoff_base_ms: 1000,
            input_backoff_max_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
    pub fn tick_deadline(&self) -> Duration {
        Duration::from_millis(self.tick_deadline_ms)
    }
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fusion & prompt
// ─────────────────────────────────────────────────────────────────────────────

/// What a tick does when a required source has never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingMode {
    /// Proceed with an explicit missing marker.
    #[default]
    Mark,
    /// Wait up to `grace_ms` for required sources, then mark.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub missing: MissingMode,
    pub grace_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            missing: MissingMode::Mark,
            grace_ms: 200,
        }
    }
}

/// Character budgets for prompt rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Budget for the whole observation section.
    pub budget_chars: usize,
    /// Budget for any single source.
    pub source_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_chars: 6000,
            source_chars: 1200,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inference endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// An OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    /// Wiped from memory when the config is dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<Zeroizing<String>>,
    pub temperature: Option<f32>,
    /// Attach the JSON-form reply schema as `response_format`.
    pub structured_output: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            temperature: Some(0.2),
            structured_output: false,
        }
    }
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("temperature", &self.temperature)
            .field("structured_output", &self.structured_output)
            .finish()
    }
}

impl EndpointConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(String::as_str)
    }

    pub fn set_api_key(&mut self, key: impl Into<String>) {
        self.api_key = Some(Zeroizing::new(key.into()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Port for the websocket telemetry stream; `None` disables it.
    pub port: Option<u16>,
    pub bus_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            port: None,
            bus_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    /// Observations older than this are flagged stale at fuse time.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(flatten)]
    pub source: InputSource,
}

fn default_min_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    /// Cycles through fixed text lines; an empty list is a source that is
    /// never reachable.
    Scripted {
        #[serde(default)]
        texts: Vec<String>,
    },
    /// Simulated camera returning a fixed scene description.
    SimCamera { description: String },
    /// One ROS 2 topic over a rosbridge websocket.
    Rosbridge {
        url: String,
        topic: String,
        #[serde(default)]
        decode: RosTopicKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RosTopicKind {
    Scan,
    Text,
    #[default]
    Structured,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action plugins
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: String,
    /// Restrict the plugin to these actions; empty means every action
    /// targeting it.
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process simulated actuator.
    Sim {
        #[serde(default)]
        latency_ms: u64,
        /// Fail every command with this detail.
        #[serde(default)]
        fail: Option<String>,
    },
    /// ROS 2 topics through a rosbridge websocket.
    Rosbridge {
        url: String,
        routes: Vec<RosRouteConfig>,
    },
    Zenoh {
        key_prefix: String,
        #[serde(default)]
        sink: SinkConfig,
    },
    Dds {
        topic_prefix: String,
        #[serde(default)]
        sink: SinkConfig,
    },
    /// Line protocol on a serial character device.
    Serial { device: String },
    /// JSON text frames to a websocket server.
    Websocket { url: String },
}

/// Where bridged protocols (Zenoh, DDS) deliver their frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// The in-process event bus, for an attached bridge process.
    #[default]
    Bus,
    Websocket { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosRouteConfig {
    pub action: String,
    pub topic: String,
    #[serde(default)]
    pub message: RosMessageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RosMessageConfig {
    Twist {
        #[serde(default = "default_x")]
        linear_x: String,
        #[serde(default = "default_y")]
        linear_y: String,
        #[serde(default = "default_theta")]
        angular_z: String,
    },
    Text {
        #[serde(default = "default_text")]
        param: String,
    },
    #[default]
    Params,
}

fn default_x() -> String {
    "x".into()
}
fn default_y() -> String {
    "y".into()
}
fn default_theta() -> String {
    "theta".into()
}
fn default_text() -> String {
    "text".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SafetyConfig {
    #[serde(default)]
    pub param_limits: Vec<ParamRangeRule>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

impl AgentConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`EmberError::Configuration`] with the parser's message.
    pub fn from_toml(raw: &str) -> Result<Self, EmberError> {
        toml::from_str(raw).map_err(|e| EmberError::Configuration(format!("invalid config: {e}")))
    }

    /// Build the action vocabulary declared by this configuration.
    ///
    /// # Errors
    ///
    /// [`EmberError::Configuration`] for duplicate or malformed definitions.
    pub fn vocabulary(&self) -> Result<ActionVocabulary, EmberError> {
        ActionVocabulary::new(self.actions.clone())
    }

    /// Check everything that can be checked before any component exists.
    ///
    /// # Errors
    ///
    /// The first problem found, as [`EmberError::Configuration`].
    pub fn validate(&self) -> Result<(), EmberError> {
        let bad = |msg: String| Err(EmberError::Configuration(msg));
        let t = &self.timing;

        if t.tick_interval_ms == 0 {
            return bad("timing.tick_interval_ms must be > 0".into());
        }
        if t.tick_deadline_ms == 0 {
            return bad("timing.tick_deadline_ms must be > 0".into());
        }
        if t.inference_timeout_ms == 0 || t.inference_timeout_ms > t.tick_deadline_ms {
            return bad(format!(
                "timing.inference_timeout_ms ({}) must be in 1..={} (the tick deadline)",
                t.inference_timeout_ms, t.tick_deadline_ms
            ));
        }
        if t.dispatch_timeout_ms == 0 {
            return bad("timing.dispatch_timeout_ms must be > 0".into());
        }
        if t.dispatch_attempts == 0 {
            return bad("timing.dispatch_attempts must be >= 1".into());
        }
        if t.input_backoff_base_ms == 0 || t.input_backoff_max_ms < t.input_backoff_base_ms {
            return bad("timing.input_backoff_* must satisfy 0 < base <= max".into());
        }
        if self.prompt.budget_chars == 0 || self.prompt.source_chars == 0 {
            return bad("prompt budgets must be > 0".into());
        }
        if self.inference.base_url.trim().is_empty() || self.inference.model.trim().is_empty() {
            return bad("inference.base_url and inference.model are required".into());
        }
        if self.telemetry.bus_capacity == 0 {
            return bad("telemetry.bus_capacity must be > 0".into());
        }

        let mut input_ids = BTreeSet::new();
        for input in &self.inputs {
            if input.id.trim().is_empty() {
                return bad("input with empty id".into());
            }
            if !input_ids.insert(input.id.as_str()) {
                return bad(format!("duplicate input id '{}'", input.id));
            }
        }

        let mut plugin_ids = BTreeSet::new();
        for plugin in &self.plugins {
            if plugin.id.trim().is_empty() {
                return bad("plugin with empty id".into());
            }
            if !plugin_ids.insert(plugin.id.as_str()) {
                return bad(format!("duplicate plugin id '{}'", plugin.id));
            }
        }

        let vocabulary = self.vocabulary()?;
        if vocabulary.is_empty() {
            return bad("the action vocabulary is empty".into());
        }
        for def in vocabulary.iter() {
            if !plugin_ids.contains(def.target.as_str()) {
                return bad(format!(
                    "action '{}' targets undeclared plugin '{}'",
                    def.name, def.target
                ));
            }
        }
        for plugin in &self.plugins {
            for action in &plugin.actions {
                if !vocabulary.contains(action) {
                    return bad(format!(
                        "plugin '{}' lists undeclared action '{action}'",
                        plugin.id
                    ));
                }
            }
        }
        for rule in &self.safety.param_limits {
            let Some(def) = vocabulary.get(&rule.action) else {
                return bad(format!("safety limit on undeclared action '{}'", rule.action));
            };
            if def.param(&rule.param).is_none() {
                return bad(format!(
                    "safety limit on undeclared parameter '{}.{}'",
                    rule.action, rule.param
                ));
            }
            if !(rule.max_abs.is_finite() && rule.max_abs >= 0.0) {
                return bad(format!("safety limit '{}.{}' must be >= 0", rule.action, rule.param));
            }
        }
        Ok(())
    }
}
