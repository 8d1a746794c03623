//! Fuser: deterministic snapshot construction.
//!
//! On every tick the [`Fuser`] copies the latest observation of every
//! source from the [`ObservationTable`] in a single synchronized step and
//! assembles a [`DecisionContext`].  It never consumes or mutates
//! observations.
//!
//! Sources that have never produced anything are handled by a declared
//! [`MissingPolicy`]: either the tick proceeds with an explicit
//! [`SnapshotState::Missing`] marker, or it waits a bounded grace period for
//! required sources first.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ember_perception::{Fuser, MissingPolicy, ObservationTable, SourcePolicy};
//! use ember_types::ActionVocabulary;
//!
//! let table = Arc::new(ObservationTable::new());
//! let fuser = Fuser::new(table, Arc::from("You are a helpful robot."), Arc::new(ActionVocabulary::default()))
//!     .with_source("front_camera", SourcePolicy::required().max_age(Duration::from_millis(500)))
//!     .with_missing_policy(MissingPolicy::MarkMissing);
//!
//! let ctx = fuser.fuse_now(1);
//! assert_eq!(ctx.missing_sources(), vec!["front_camera"]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ember_types::{
    ActionVocabulary, DecisionContext, SnapshotState, SourceHealth, SourceId, SourceSnapshot,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::table::ObservationTable;

/// What to do when a required source has never produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Proceed immediately; the source appears as [`SnapshotState::Missing`].
    #[default]
    MarkMissing,
    /// Wait up to `grace` for every required source, then proceed with
    /// whatever is missing marked as such.
    WaitFor { grace: Duration },
}

/// Per-source fusion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePolicy {
    pub required: bool,
    /// Observations older than this are flagged [`SnapshotState::Stale`].
    pub max_age: Option<Duration>,
}

impl SourcePolicy {
    pub fn required() -> Self {
        Self {
            required: true,
            max_age: None,
        }
    }

    pub fn optional() -> Self {
        Self::default()
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Builds one [`DecisionContext`] per tick.
pub struct Fuser {
    table: Arc<ObservationTable>,
    sources: BTreeMap<SourceId, SourcePolicy>,
    policy: MissingPolicy,
    persona: Arc<str>,
    vocabulary: Arc<ActionVocabulary>,
}

impl Fuser {
    pub fn new(
        table: Arc<ObservationTable>,
        persona: Arc<str>,
        vocabulary: Arc<ActionVocabulary>,
    ) -> Self {
        Self {
            table,
            sources: BTreeMap::new(),
            policy: MissingPolicy::default(),
            persona,
            vocabulary,
        }
    }

    /// Declare a source.  Declared sources always appear in the snapshot.
    pub fn with_source(mut self, source_id: impl Into<SourceId>, policy: SourcePolicy) -> Self {
        let source_id = source_id.into();
        self.table.register(&source_id);
        self.sources.insert(source_id, policy);
        self
    }

    pub fn with_missing_policy(mut self, policy: MissingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table(&self) -> &Arc<ObservationTable> {
        &self.table
    }

    pub fn vocabulary(&self) -> &Arc<ActionVocabulary> {
        &self.vocabulary
    }

    /// Fuse according to the declared [`MissingPolicy`].
    pub async fn fuse(&self, tick_id: u64) -> DecisionContext {
        if let MissingPolicy::WaitFor { grace } = self.policy {
            self.wait_for_required(tick_id, Instant::now() + grace).await;
        }
        self.fuse_now(tick_id)
    }

    /// Fuse immediately, marking missing sources.
    pub fn fuse_now(&self, tick_id: u64) -> DecisionContext {
        let fused_at = Instant::now();
        let mut views = self.table.snapshot();
        let mut snapshot = BTreeMap::new();

        for (id, policy) in &self.sources {
            let view = views.remove(id);
            let (observation, health) = view
                .map(|v| (v.observation, v.health))
                .unwrap_or((None, SourceHealth::Healthy));
            let state = match &observation {
                None => SnapshotState::Missing,
                Some(o) if policy.max_age.is_some_and(|max| o.age(fused_at) > max) => {
                    SnapshotState::Stale
                }
                Some(_) => SnapshotState::Present,
            };
            snapshot.insert(
                id.clone(),
                SourceSnapshot {
                    observation,
                    health,
                    state,
                    required: policy.required,
                },
            );
        }
        // Undeclared publishers are included as optional sources.
        for (id, view) in views {
            let state = if view.observation.is_some() {
                SnapshotState::Present
            } else {
                SnapshotState::Missing
            };
            snapshot.insert(
                id,
                SourceSnapshot {
                    observation: view.observation,
                    health: view.health,
                    state,
                    required: false,
                },
            );
        }

        debug!(tick_id, sources = snapshot.len(), "fused snapshot");
        DecisionContext {
            tick_id,
            fused_at,
            snapshot,
            persona: self.persona.clone(),
            vocabulary: self.vocabulary.clone(),
        }
    }

    fn required_missing(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|(id, p)| p.required && self.table.latest(id).is_none())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    async fn wait_for_required(&self, tick_id: u64, deadline: Instant) {
        loop {
            let notified = self.table.updated();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let missing = self.required_missing();
            if missing.is_empty() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(tick_id, ?missing, "grace period elapsed with required sources missing");
                return;
            }
        }
    }
}
