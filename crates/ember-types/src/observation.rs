//! Observations produced by input plugins and the fused per-tick snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::vocabulary::ActionVocabulary;

/// Stable identifier of an input source, e.g. `"front_camera"`.
pub type SourceId = String;

/// Laser returns outside this window are treated as invalid.
const MIN_VALID_RANGE_M: f32 = 0.1;

// ────────────────────────────────────────────────────────────────────────────
// Payloads
// ────────────────────────────────────────────────────────────────────────────

/// A camera frame.  Raw pixels never reach the prompt; only the metadata
/// and the optional `description` (e.g. from an on-device captioner) do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    /// e.g. `"rgb8"`, `"mono8"`, `"jpeg"`.
    pub encoding: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// A planar laser scan (`sensor_msgs/LaserScan` shaped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    /// Measured distances in metres.
    pub ranges: Vec<f32>,
    /// Bearing of the first reading (radians, robot frame).
    pub angle_min_rad: f32,
    /// Angular step between consecutive readings (radians).
    pub angle_increment_rad: f32,
    /// Readings beyond this distance are discarded.
    pub range_max_m: f32,
}

impl LaserScan {
    /// Closest valid return as `(range_m, bearing_rad)`.
    pub fn nearest(&self) -> Option<(f32, f32)> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_finite() && **r >= MIN_VALID_RANGE_M && **r <= self.range_max_m)
            .map(|(i, r)| (*r, self.angle_min_rad + i as f32 * self.angle_increment_rad))
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }

    /// Number of readings that fall inside the valid window.
    pub fn valid_count(&self) -> usize {
        self.ranges
            .iter()
            .filter(|r| r.is_finite() && **r >= MIN_VALID_RANGE_M && **r <= self.range_max_m)
            .count()
    }
}

/// One labelled detection from a perception model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub bearing_rad: Option<f32>,
    #[serde(default)]
    pub distance_m: Option<f32>,
}

/// Opaque typed blob carried by an [`Observation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationPayload {
    /// Transcribed speech, chat/social feed text, status lines.
    Text { text: String },
    Image(ImageFrame),
    Scan(LaserScan),
    Detections { items: Vec<Detection> },
    /// Anything else (odometry, GPS fix, battery state, …).
    Structured { value: serde_json::Value },
}

impl ObservationPayload {
    /// Short kind label used in prompts and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            ObservationPayload::Text { .. } => "text",
            ObservationPayload::Image(_) => "image",
            ObservationPayload::Scan(_) => "scan",
            ObservationPayload::Detections { .. } => "detections",
            ObservationPayload::Structured { .. } => "structured",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Observation
// ────────────────────────────────────────────────────────────────────────────

/// A timestamped reading from exactly one input source.  Immutable once
/// emitted; shared by `Arc` between the observation table and snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub source_id: SourceId,
    /// Monotonic capture time.
    pub captured_at: Instant,
    /// Per-source counter, incremented on every emission.
    pub sequence: u64,
    pub payload: ObservationPayload,
}

impl Observation {
    /// Age of this observation relative to `now` (zero if `now` is earlier).
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

/// Health reported by an input source's runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceHealth {
    #[default]
    Healthy,
    /// The source could not be reached; the runner is backing off.
    Degraded {
        reason: String,
        consecutive_failures: u32,
    },
}

impl SourceHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SourceHealth::Degraded { .. })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Presence of a source in a fused snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Latest observation is present and within its age limit.
    Present,
    /// Latest observation is present but older than the source's `max_age`.
    Stale,
    /// The source has never produced an observation.
    Missing,
}

/// The fused view of one source at tick time.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub observation: Option<Arc<Observation>>,
    pub health: SourceHealth,
    pub state: SnapshotState,
    pub required: bool,
}

/// Fused snapshot of all current observations used to build one inference
/// request.  Created fresh each tick and owned by that tick's pipeline run.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub tick_id: u64,
    pub fused_at: Instant,
    /// Ordered by source id so prompt rendering is deterministic.
    pub snapshot: BTreeMap<SourceId, SourceSnapshot>,
    pub persona: Arc<str>,
    pub vocabulary: Arc<ActionVocabulary>,
}

impl DecisionContext {
    /// Sources with no observation at all.
    pub fn missing_sources(&self) -> Vec<&str> {
        self.snapshot
            .iter()
            .filter(|(_, s)| s.state == SnapshotState::Missing)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
