use std::time::Duration;

use thiserror::Error;

/// Global error type spanning input degradation, inference failures, action
/// rejection, actuator faults, and configuration mistakes.
///
/// Only [`EmberError::Configuration`] is fatal; every other variant is
/// contained to a single source, command, or tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmberError {
    #[error("Input '{source_id}' unavailable: {reason}")]
    InputUnavailable { source_id: String, reason: String },

    #[error("Inference timed out after {after:?}")]
    InferenceTimeout { after: Duration },

    #[error("Inference failed: {0}")]
    InferenceFailure(String),

    #[error("Action candidate rejected: {0}")]
    ParseRejected(String),

    #[error("Dispatch to '{target}' failed: {details}")]
    DispatchFailure { target: String, details: String },

    #[error("Dispatch to '{target}' timed out after {after:?}")]
    DispatchTimeout { target: String, after: Duration },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Safety interlock engaged: {0}")]
    Halted(String),
}

impl EmberError {
    /// `true` for errors that must stop the process before the loop starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EmberError::Configuration(_))
    }
}
