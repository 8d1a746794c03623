//! Action Plugin capability: the actuator-sink side of the runtime.
//!
//! Concrete transports (ROS2, Zenoh, DDS, serial, websocket, simulated)
//! implement [`ActionPlugin`] and register themselves with a
//! [`PluginRegistry`][crate::registry::PluginRegistry].  The router only ever
//! talks to the trait, so transports can be swapped without touching the
//! decision loop.

use std::time::Duration;

use async_trait::async_trait;
use ember_types::{ActionCommand, EmberError};

/// A hardware or simulated connector that executes validated commands.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    /// Stable identifier referenced by action definitions, e.g. `"base"`.
    fn id(&self) -> &str;

    /// Whether this plugin knows how to execute `action_name`.
    fn supports(&self, action_name: &str) -> bool;

    /// Whether the plugin is currently able to accept commands.  The parser
    /// rejects commands for unhealthy targets before dispatch.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Execute one command and return a short acknowledgement.
    ///
    /// `timeout` is the time left for this attempt.  A plugin that can stop
    /// its hardware call cleanly should do so and return
    /// [`EmberError::DispatchTimeout`]; the router drops the call once the
    /// budget is spent either way.  Implementations should not retry.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::DispatchFailure`] if the hardware rejected or
    /// failed the command, [`EmberError::DispatchTimeout`] if it gave up
    /// within `timeout`.
    async fn execute(
        &self,
        command: &ActionCommand,
        timeout: Duration,
    ) -> Result<String, EmberError>;
}
