//! Telemetry sinks: where the loop reports what each tick did.
//!
//! The loop only writes; it never reads anything back from a sink.
//! [`EventBusSink`] fans records out on the [`EventBus`] so the websocket
//! [`TelemetryServer`](ember_middleware::TelemetryServer), loggers, and
//! tests can all observe the same stream.

use std::sync::Arc;

use ember_middleware::{EventBus, Topic};
use ember_types::{DispatchStatus, Event, EventPayload, SourceHealth, TickRecord};
use tracing::trace;

const SOURCE: &str = "ember-runtime::agent_loop";

/// Write-only receiver of per-tick telemetry.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &TickRecord);

    /// A source changed between healthy and degraded.
    fn health_changed(&self, _source_id: &str, _health: &SourceHealth) {}
}

/// Publishes tick records on [`Topic::Telemetry`] and actuator faults on
/// [`Topic::SystemAlerts`].  Publishing with no subscribers is not an error.
pub struct EventBusSink {
    bus: Arc<EventBus>,
}

impl EventBusSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        if let Err(e) = self.bus.publish_to(topic, Event::new(SOURCE, payload)) {
            trace!(error = %e, "telemetry event dropped");
        }
    }
}

impl TelemetrySink for EventBusSink {
    fn record(&self, record: &TickRecord) {
        for result in &record.dispatch {
            if matches!(result.status, DispatchStatus::Failed | DispatchStatus::TimedOut) {
                self.publish(
                    Topic::SystemAlerts,
                    EventPayload::ActuatorFault {
                        target: result.target_plugin_id.clone(),
                        message: format!(
                            "tick {} {}: {}",
                            result.tick_id,
                            result.action_name,
                            result.detail.as_deref().unwrap_or("failed")
                        ),
                    },
                );
            }
        }
        self.publish(Topic::Telemetry, EventPayload::Tick(Box::new(record.clone())));
    }

    fn health_changed(&self, source_id: &str, health: &SourceHealth) {
        self.publish(
            Topic::Telemetry,
            EventPayload::InputHealth {
                source_id: source_id.to_string(),
                health: health.clone(),
            },
        );
    }
}
