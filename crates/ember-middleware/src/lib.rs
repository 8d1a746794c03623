//! `ember-middleware` – The Nervous System
//!
//! Moves bytes between the runtime and the outside world without caring
//! what they mean.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus on Tokio broadcast
//!   channels.
//! - [`transport`] – [`TransportPlugin`]: an action plugin assembled from a
//!   [`CommandEncoder`] and a [`FrameSink`].
//! - [`encoders`] – rosbridge (ROS 2), Zenoh, DDS, serial line, and
//!   websocket JSON encoders.
//! - [`sinks`] – bus, websocket client, and serial/writer sinks.
//! - [`ingest`] – rosbridge subscriptions feeding channel-fed input sources.
//! - [`telemetry_server`] – read-only websocket stream of tick records.

pub mod bus;
pub mod encoders;
pub mod ingest;
pub mod sinks;
pub mod telemetry_server;
pub mod transport;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use encoders::{
    DdsEncoder, RosMessage, RosbridgeEncoder, SerialLineEncoder, WebSocketJsonEncoder,
    ZenohEncoder,
};
pub use ingest::{RosDecode, RosbridgeIngest};
pub use sinks::{BusSink, WebSocketSink, WriterSink};
pub use telemetry_server::TelemetryServer;
pub use transport::{CommandEncoder, Frame, FrameSink, TransportPlugin};
