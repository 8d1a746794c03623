//! Frame sinks: where encoded commands physically go.
//!
//! - [`BusSink`] – publishes frames on [`Topic::Frames`] for bus-attached
//!   bridges and headless runs.
//! - [`WebSocketSink`] – a websocket client (rosbridge server, simulator),
//!   reconnected lazily on the next send after a failure.  A failed sink
//!   reports unhealthy only for a backoff window, then is tried again.
//! - [`WriterSink`] – any async writer, typically a serial device opened
//!   with [`WriterSink::open_device`].

use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ember_hal::{Backoff, BackoffConfig};
use ember_types::{EmberError, Event, EventPayload};
use futures_util::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};

use crate::bus::{EventBus, Topic};
use crate::transport::{Frame, FrameSink};

// ────────────────────────────────────────────────────────────────────────────
// BusSink
// ────────────────────────────────────────────────────────────────────────────

/// Publishes each frame as an [`EventPayload::Frame`] on [`Topic::Frames`].
///
/// The event `source` carries the frame channel.
pub struct BusSink {
    plugin_id: String,
    bus: Arc<EventBus>,
}

impl BusSink {
    pub fn new(plugin_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
        }
    }
}

#[async_trait]
impl FrameSink for BusSink {
    async fn send(&self, frame: &Frame) -> Result<(), EmberError> {
        let source = if frame.channel.is_empty() {
            format!("ember-middleware::{}", self.plugin_id)
        } else {
            frame.channel.clone()
        };
        let event = Event::new(
            source,
            EventPayload::Frame {
                plugin_id: self.plugin_id.clone(),
                frame: frame.body.clone(),
            },
        );
        self.bus
            .publish_to(Topic::Frames, event)
            .map(|_| ())
            .map_err(|e| EmberError::DispatchFailure {
                target: self.plugin_id.clone(),
                details: e.to_string(),
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocketSink
// ────────────────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default wait before a failed websocket target is offered commands again.
pub const RECONNECT_BACKOFF: BackoffConfig = BackoffConfig {
    base: Duration::from_millis(500),
    max: Duration::from_secs(10),
};

#[derive(Debug)]
struct LinkHealth {
    backoff: Backoff,
    /// Unhealthy until this instant; `None` while the link works.
    retry_at: Option<Instant>,
}

/// Sends each frame body as a websocket text message.
pub struct WebSocketSink {
    url: String,
    stream: Mutex<Option<WsStream>>,
    health: std::sync::Mutex<LinkHealth>,
}

impl WebSocketSink {
    /// Create a sink for `url`.  No connection is made until the first send.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: Mutex::new(None),
            health: std::sync::Mutex::new(LinkHealth {
                backoff: Backoff::new(RECONNECT_BACKOFF),
                retry_at: None,
            }),
        }
    }

    /// Replace the reconnect backoff.
    pub fn with_backoff(self, config: BackoffConfig) -> Self {
        self.health_mut().backoff = Backoff::new(config);
        self
    }

    fn health_mut(&self) -> std::sync::MutexGuard<'_, LinkHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self, details: impl Into<String>) -> EmberError {
        let mut health = self.health_mut();
        let delay = health.backoff.next_delay();
        health.retry_at = Some(Instant::now() + delay);
        warn!(
            url = %self.url,
            failures = health.backoff.failures(),
            retry_in_ms = delay.as_millis() as u64,
            "websocket transport unavailable"
        );
        EmberError::DispatchFailure {
            target: self.url.clone(),
            details: details.into(),
        }
    }

    fn recovered(&self) {
        let mut health = self.health_mut();
        if health.retry_at.take().is_some() {
            info!(url = %self.url, "websocket transport recovered");
        }
        health.backoff.reset();
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    fn is_healthy(&self) -> bool {
        self.health_mut()
            .retry_at
            .is_none_or(|at| Instant::now() >= at)
    }

    async fn send(&self, frame: &Frame) -> Result<(), EmberError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let (ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| self.failure(format!("connect failed: {e}")))?;
            info!(url = %self.url, "websocket transport connected");
            *guard = Some(ws);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(self.failure("not connected"));
        };
        if let Err(e) = ws.send(Message::Text(frame.body.clone().into())).await {
            warn!(url = %self.url, error = %e, "websocket send failed; dropping connection");
            *guard = None;
            return Err(self.failure(format!("send failed: {e}")));
        }
        self.recovered();
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WriterSink
// ────────────────────────────────────────────────────────────────────────────

/// Writes each frame body to an async byte stream and flushes it.
pub struct WriterSink<W> {
    label: String,
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(label: impl Into<String>, writer: W) -> Self {
        Self {
            label: label.into(),
            writer: Mutex::new(writer),
        }
    }
}

impl WriterSink<tokio::fs::File> {
    /// Open a character device (e.g. `/dev/ttyUSB0`) for writing.  Line
    /// settings such as baud rate are expected to be configured outside the
    /// process.
    ///
    /// # Errors
    ///
    /// [`EmberError::Configuration`] if the device cannot be opened.
    pub async fn open_device(path: impl AsRef<Path>) -> Result<Self, EmberError> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| {
                EmberError::Configuration(format!("cannot open {}: {e}", path.display()))
            })?;
        Ok(Self::new(path.display().to_string(), file))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for WriterSink<W> {
    async fn send(&self, frame: &Frame) -> Result<(), EmberError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(frame.body.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| EmberError::DispatchFailure {
            target: self.label.clone(),
            details: format!("write failed: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use ember_hal::ActionPlugin;
    use ember_types::ParamValue;

    use super::*;
    use crate::encoders::tests::command;
    use crate::encoders::{SerialLineEncoder, WebSocketJsonEncoder};
    use crate::transport::TransportPlugin;

    #[tokio::test]
    async fn bus_sink_publishes_frame_events() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe_to(Topic::Frames);
        let plugin = TransportPlugin::new(
            "sim",
            Box::new(WebSocketJsonEncoder),
            Box::new(BusSink::new("sim", Arc::clone(&bus))),
        );

        let cmd = command("wave", vec![("times", ParamValue::Integer(3))]);
        plugin.execute(&cmd, Duration::from_secs(1)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "ember-middleware::sim");
        match event.payload {
            EventPayload::Frame { plugin_id, frame } => {
                assert_eq!(plugin_id, "sim");
                assert!(frame.contains("\"wave\""));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bus_sink_without_listeners_fails_dispatch() {
        let bus = Arc::new(EventBus::default());
        let sink = BusSink::new("sim", bus);
        let err = sink
            .send(&Frame {
                channel: "/x".into(),
                body: "{}".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::DispatchFailure { .. }));
    }

    #[tokio::test]
    async fn writer_sink_writes_serial_lines() {
        let (client, mut server) = tokio::io::duplex(256);
        let plugin = TransportPlugin::new(
            "arm",
            Box::new(SerialLineEncoder),
            Box::new(WriterSink::new("duplex", client)),
        )
        .with_actions(["grip"]);
        assert!(plugin.supports("grip"));
        assert!(!plugin.supports("move"));

        plugin
            .execute(
                &command("grip", vec![("force", ParamValue::Number(0.5))]),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"GRIP force=0.5\n");
    }

    #[tokio::test]
    async fn websocket_sink_reports_unreachable_server() {
        let sink = WebSocketSink::new("ws://127.0.0.1:1");
        assert!(sink.is_healthy());
        let err = sink
            .send(&Frame {
                channel: String::new(),
                body: "{}".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::DispatchFailure { .. }));
        assert!(!sink.is_healthy());
    }

    #[tokio::test]
    async fn websocket_target_recovers_when_the_server_returns() {
        use ember_hal::PluginRegistry;
        use futures_util::StreamExt;
        use tokio::net::TcpListener;

        // Reserve a free port, then leave it closed.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let window = Duration::from_millis(40);
        let sink = WebSocketSink::new(format!("ws://{addr}")).with_backoff(BackoffConfig {
            base: window,
            max: window,
        });
        let plugin = TransportPlugin::new("ws", Box::new(WebSocketJsonEncoder), Box::new(sink))
            .with_actions(["speak"]);
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(plugin));
        let plugin = registry.get("ws").unwrap();
        let speak = command("speak", vec![("text", ParamValue::String("hi".into()))]);

        assert!(plugin.execute(&speak, Duration::from_secs(1)).await.is_err());
        assert!(!registry.is_available("ws", "speak"));

        let listener = TcpListener::bind(addr).await.unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            match ws.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                other => panic!("expected a text frame, got {other:?}"),
            }
        });

        tokio::time::sleep(window + Duration::from_millis(20)).await;
        assert!(registry.is_available("ws", "speak"));
        plugin.execute(&speak, Duration::from_secs(1)).await.unwrap();
        assert!(server.await.unwrap().contains("\"speak\""));
        assert!(registry.is_available("ws", "speak"));
    }
}
