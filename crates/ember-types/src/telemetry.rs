//! Per-tick telemetry records and the event envelope carried on the bus.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::{DispatchResult, duration_ms};
use crate::observation::{SnapshotState, SourceHealth, SourceId};
use crate::vocabulary::{CommandSummary, Rejection};

/// Why a tick was aborted before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    InferenceTimeout,
    InferenceFailure(String),
    /// Inference returned, but after the tick deadline.
    DeadlineExceeded,
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Inference completed in time; zero or more commands were dispatched.
    Committed,
    Aborted { reason: AbortReason },
    /// The tick never ran (paused, halted).
    Skipped { reason: String },
}

/// Telemetry view of one source in the fused snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_id: SourceId,
    pub state: SnapshotState,
    pub health: SourceHealth,
    #[serde(default)]
    pub age_ms: Option<u64>,
    /// The prompt builder shortened or dropped this source's rendering.
    #[serde(default)]
    pub truncated: bool,
}

/// Wall-clock time spent in each stage of the tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLatencies {
    #[serde(with = "duration_ms")]
    pub fuse: Duration,
    #[serde(with = "duration_ms")]
    pub prompt: Duration,
    #[serde(with = "duration_ms")]
    pub inference: Duration,
    #[serde(with = "duration_ms")]
    pub parse: Duration,
    #[serde(with = "duration_ms")]
    pub dispatch: Duration,
    #[serde(with = "duration_ms")]
    pub total: Duration,
}

/// Everything that happened in one tick: context summary, raw response,
/// parsed candidates, accepted commands, rejections, dispatch outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick_id: u64,
    pub started_at: DateTime<Utc>,
    pub outcome: TickOutcome,
    #[serde(default)]
    pub sources: Vec<SourceSummary>,
    #[serde(default)]
    pub prompt_chars: usize,
    #[serde(default)]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub candidates: usize,
    #[serde(default)]
    pub commands: Vec<CommandSummary>,
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    #[serde(default)]
    pub dispatch: Vec<DispatchResult>,
    #[serde(default)]
    pub latencies: StageLatencies,
}

impl TickRecord {
    /// An empty record for a tick that starts now.
    pub fn new(tick_id: u64, outcome: TickOutcome) -> Self {
        Self {
            tick_id,
            started_at: Utc::now(),
            outcome,
            sources: Vec::new(),
            prompt_chars: 0,
            raw_response: None,
            candidates: 0,
            commands: Vec::new(),
            rejections: Vec::new(),
            dispatch: Vec::new(),
            latencies: StageLatencies::default(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.outcome == TickOutcome::Committed
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Operator commands delivered to the agent loop between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    /// Engage the halt interlock: every command is rejected until released.
    EmergencyStop,
    ReleaseStop,
}

/// Structured envelope for all internal bus traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"ember-runtime::agent_loop"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Tick(Box<TickRecord>),
    InputHealth {
        source_id: SourceId,
        health: SourceHealth,
    },
    Control(ControlCommand),
    /// A frame produced by a transport action plugin, for bus-attached bridges.
    Frame { plugin_id: String, frame: String },
    ActuatorFault { target: String, message: String },
}
