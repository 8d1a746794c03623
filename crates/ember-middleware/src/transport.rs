//! The Universal Adapter Pattern, applied to actuator transports.
//!
//! The decision loop never speaks ROS 2, Zenoh, DDS, serial, or websocket
//! directly.  It hands a validated [`ActionCommand`] to an
//! [`ActionPlugin`]; a [`TransportPlugin`] is the plugin that turns that
//! command into a protocol frame with a [`CommandEncoder`] and delivers it
//! with a [`FrameSink`].
//!
//! # Overview
//!
//! - [`CommandEncoder`] – command → [`Frame`] for one wire protocol
//!   (see [`encoders`][crate::encoders]).
//! - [`FrameSink`] – where frames go: the event bus, a websocket, a serial
//!   device (see [`sinks`][crate::sinks]).
//! - [`TransportPlugin`] – the pair, registered under one plugin id.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use ember_hal::ActionPlugin;
use ember_types::{ActionCommand, EmberError};
use tracing::debug;

/// One encoded message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol-level address: ROS topic, Zenoh key expression, DDS topic,
    /// or empty for point-to-point links.
    pub channel: String,
    /// Encoded body (JSON text or a protocol line).
    pub body: String,
}

/// Encodes commands for one wire protocol.
pub trait CommandEncoder: Send + Sync {
    /// Protocol label used in logs, e.g. `"rosbridge"`.
    fn protocol(&self) -> &'static str;

    /// Whether this encoder has a mapping for `action_name`.
    fn supports(&self, action_name: &str) -> bool;

    /// Encode `command`.
    ///
    /// # Errors
    ///
    /// [`EmberError::DispatchFailure`] if the command has no mapping or a
    /// required parameter cannot be expressed in the protocol.
    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError>;
}

/// Delivers encoded frames to the outside world.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Whether the link is currently usable.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Deliver one frame.
    ///
    /// # Errors
    ///
    /// [`EmberError::DispatchFailure`] when the link rejects or drops it.
    async fn send(&self, frame: &Frame) -> Result<(), EmberError>;
}

/// An [`ActionPlugin`] built from an encoder and a sink.
pub struct TransportPlugin {
    id: String,
    actions: Option<BTreeSet<String>>,
    encoder: Box<dyn CommandEncoder>,
    sink: Box<dyn FrameSink>,
}

impl TransportPlugin {
    pub fn new(
        id: impl Into<String>,
        encoder: Box<dyn CommandEncoder>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            id: id.into(),
            actions: None,
            encoder,
            sink,
        }
    }

    /// Restrict the plugin to the listed actions, on top of what the encoder
    /// supports.
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = Some(actions.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl ActionPlugin for TransportPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, action_name: &str) -> bool {
        self.actions
            .as_ref()
            .is_none_or(|set| set.contains(action_name))
            && self.encoder.supports(action_name)
    }

    fn is_healthy(&self) -> bool {
        self.sink.is_healthy()
    }

    async fn execute(
        &self,
        command: &ActionCommand,
        timeout: Duration,
    ) -> Result<String, EmberError> {
        let frame = self.encoder.encode(command)?;
        debug!(
            plugin = %self.id,
            protocol = self.encoder.protocol(),
            channel = %frame.channel,
            bytes = frame.body.len(),
            "sending frame"
        );
        tokio::time::timeout(timeout, self.sink.send(&frame))
            .await
            .map_err(|_| EmberError::DispatchTimeout {
                target: self.id.clone(),
                after: timeout,
            })??;
        Ok(format!(
            "{} frame sent on '{}'",
            self.encoder.protocol(),
            frame.channel
        ))
    }
}
