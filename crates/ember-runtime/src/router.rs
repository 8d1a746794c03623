//! Action Router: validated commands → action plugins, one result each.
//!
//! - Each command is looked up by `target_plugin_id`; an unknown target
//!   yields `Failed` ("no such target") instead of an error.
//! - Each plugin call runs under a per-command timeout, further capped by
//!   the tick deadline.  A hung call is reported `TimedOut` and abandoned.
//! - Commands for the same target run in order; different targets run
//!   concurrently.  A failure never blocks or fails a sibling.
//! - Only actions declared idempotent are re-attempted, up to
//!   `max_attempts` executions in total.  A command whose turn comes after
//!   the deadline is `Skipped` without touching the plugin.

use std::collections::BTreeMap;
use std::time::Duration;

use ember_hal::PluginRegistry;
use ember_types::{ActionCommand, DispatchResult, DispatchStatus, EmberError};
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub struct ActionRouter {
    registry: PluginRegistry,
    timeout: Duration,
    max_attempts: u32,
}

impl ActionRouter {
    pub fn new(registry: PluginRegistry, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            registry,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Execute one command.
    #[instrument(skip_all, fields(
        tick_id = command.tick_id(),
        action = command.action_name(),
        target = command.target_plugin_id(),
    ))]
    pub async fn dispatch(
        &self,
        command_index: usize,
        command: &ActionCommand,
        deadline: Instant,
    ) -> DispatchResult {
        let started = Instant::now();
        let result = |status: DispatchStatus, detail: String, attempts: u32| DispatchResult {
            tick_id: command.tick_id(),
            command_index,
            action_name: command.action_name().to_string(),
            target_plugin_id: command.target_plugin_id().to_string(),
            status,
            detail: Some(detail),
            attempts,
            latency: started.elapsed(),
        };

        if started >= deadline {
            return result(DispatchStatus::Skipped, "tick deadline passed".into(), 0);
        }
        let Some(plugin) = self.registry.get(command.target_plugin_id()) else {
            warn!("no such target");
            return result(
                DispatchStatus::Failed,
                format!("no such target '{}'", command.target_plugin_id()),
                0,
            );
        };

        let limit = if command.is_idempotent() {
            self.max_attempts
        } else {
            1
        };
        let mut attempts = 0;
        let mut last = (DispatchStatus::Skipped, "tick deadline passed".to_string());
        while attempts < limit {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let budget = self.timeout.min(deadline - now);
            attempts += 1;
            last = match tokio::time::timeout(budget, plugin.execute(command, budget)).await {
                Ok(Ok(ack)) => {
                    info!(attempts, "dispatched");
                    return result(DispatchStatus::Succeeded, ack, attempts);
                }
                Ok(Err(e @ EmberError::DispatchTimeout { .. })) => {
                    (DispatchStatus::TimedOut, e.to_string())
                }
                Ok(Err(e)) => (DispatchStatus::Failed, e.to_string()),
                Err(_) => (
                    DispatchStatus::TimedOut,
                    format!("no acknowledgement within {}ms", budget.as_millis()),
                ),
            };
            warn!(attempts, status = ?last.0, detail = %last.1, "dispatch attempt failed");
        }
        result(last.0, last.1, attempts)
    }

    /// Execute every command of one tick and return results in command
    /// order.
    pub async fn dispatch_all(
        &self,
        commands: &[ActionCommand],
        deadline: Instant,
    ) -> Vec<DispatchResult> {
        let mut by_target: BTreeMap<&str, Vec<(usize, &ActionCommand)>> = BTreeMap::new();
        for (i, command) in commands.iter().enumerate() {
            by_target
                .entry(command.target_plugin_id())
                .or_default()
                .push((i, command));
        }
        debug!(commands = commands.len(), targets = by_target.len(), "dispatching");

        let lanes = by_target.into_values().map(|lane| async move {
            let mut results = Vec::with_capacity(lane.len());
            for (i, command) in lane {
                results.push(self.dispatch(i, command, deadline).await);
            }
            results
        });
        let mut results: Vec<DispatchResult> = join_all(lanes).await.into_iter().flatten().collect();
        results.sort_by_key(|r| r.command_index);
        results
    }
}
