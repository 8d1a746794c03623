use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Terminal state of one dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Never started: the tick deadline had already passed.
    Skipped,
}

/// Outcome of executing one [`ActionCommand`](crate::ActionCommand).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub tick_id: u64,
    /// Position of the command in the tick's accepted command list.
    pub command_index: usize,
    pub action_name: String,
    pub target_plugin_id: String,
    pub status: DispatchStatus,
    /// Plugin acknowledgement or error text.
    #[serde(default)]
    pub detail: Option<String>,
    /// Number of times the plugin was invoked (0 when skipped).
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

impl DispatchResult {
    pub fn succeeded(&self) -> bool {
        self.status == DispatchStatus::Succeeded
    }
}

/// Unparsed model output for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInferenceResponse {
    pub tick_id: u64,
    pub text: String,
    pub arrived_at: Instant,
    pub latency: Duration,
}

/// Serialize a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
