//! Latest-observation table.
//!
//! The only state in the runtime written by multiple concurrent tasks: every
//! input runner publishes into it, the Fuser reads it once per tick.  Each
//! source has exactly one slot holding its newest observation and health.
//! Writes replace the whole slot under the write lock and reads copy every
//! slot under a single read lock, so a snapshot never sees a half-updated
//! entry and never skews two sources against each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ember_hal::ObservationSink;
use ember_types::{Observation, SourceHealth, SourceId};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
struct Slot {
    observation: Option<Arc<Observation>>,
    health: SourceHealth,
}

/// A consistent copy of one slot.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub observation: Option<Arc<Observation>>,
    pub health: SourceHealth,
}

/// Last-writer-wins slot per source.
#[derive(Debug, Default)]
pub struct ObservationTable {
    slots: RwLock<HashMap<SourceId, Slot>>,
    updated: Notify,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `source_id` has a slot, so it shows up as missing until its
    /// first observation arrives.
    pub fn register(&self, source_id: &str) {
        self.write().entry(source_id.to_string()).or_default();
    }

    /// Replace the latest observation for its source.
    pub fn publish(&self, observation: Arc<Observation>) {
        {
            let mut slots = self.write();
            let slot = slots.entry(observation.source_id.clone()).or_default();
            slot.observation = Some(observation);
        }
        self.updated.notify_waiters();
    }

    /// Flag a source as failing.  Its last observation, if any, is kept.
    pub fn mark_degraded(&self, source_id: &str, reason: &str, consecutive_failures: u32) {
        let mut slots = self.write();
        let slot = slots.entry(source_id.to_string()).or_default();
        slot.health = SourceHealth::Degraded {
            reason: reason.to_string(),
            consecutive_failures,
        };
        debug!(source = source_id, consecutive_failures, "source degraded");
    }

    pub fn mark_healthy(&self, source_id: &str) {
        let mut slots = self.write();
        slots.entry(source_id.to_string()).or_default().health = SourceHealth::Healthy;
    }

    /// Copy every slot in one synchronized step.
    pub fn snapshot(&self) -> HashMap<SourceId, SlotView> {
        self.read()
            .iter()
            .map(|(id, slot)| {
                (
                    id.clone(),
                    SlotView {
                        observation: slot.observation.clone(),
                        health: slot.health.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn latest(&self, source_id: &str) -> Option<Arc<Observation>> {
        self.read().get(source_id).and_then(|s| s.observation.clone())
    }

    /// Resolves on the next [`publish`](Self::publish).
    pub fn updated(&self) -> tokio::sync::futures::Notified<'_> {
        self.updated.notified()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SourceId, Slot>> {
        self.slots.read().unwrap_or_else(|poisoned| {
            warn!("observation table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SourceId, Slot>> {
        self.slots.write().unwrap_or_else(|poisoned| {
            warn!("observation table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl ObservationSink for ObservationTable {
    fn publish(&self, observation: Arc<Observation>) {
        ObservationTable::publish(self, observation);
    }

    fn mark_degraded(&self, source_id: &str, reason: &str, consecutive_failures: u32) {
        ObservationTable::mark_degraded(self, source_id, reason, consecutive_failures);
    }

    fn mark_healthy(&self, source_id: &str) {
        ObservationTable::mark_healthy(self, source_id);
    }
}
