//! Live telemetry over WebSocket.
//!
//! [`TelemetryServer`] accepts websocket clients (dashboards, loggers) and
//! streams every event published on [`Topic::Telemetry`] and
//! [`Topic::SystemAlerts`] as one JSON text message.  Each tick therefore
//! shows up as an `{"payload":{"type":"tick","data":{…}}}` object carrying
//! the full [`TickRecord`][ember_types::TickRecord].
//!
//! The stream is one-way.  Inbound client messages are read only to notice
//! closes; nothing a client sends reaches the decision loop.

use std::net::SocketAddr;
use std::sync::Arc;

use ember_types::{EmberError, Event};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::bus::{EventBus, Topic};

#[derive(Clone)]
pub struct TelemetryServer {
    bus: Arc<EventBus>,
}

impl TelemetryServer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Bind `addr` and serve until the task is dropped.
    ///
    /// # Errors
    ///
    /// [`EmberError::Configuration`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), EmberError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EmberError::Configuration(format!("telemetry bind on {addr}: {e}")))?;
        info!(%addr, "telemetry websocket listening");
        self.serve(listener).await
    }

    /// Serve clients on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), EmberError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            error!(%peer, error = %e, "telemetry client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "telemetry accept error"),
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), EmberError> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| EmberError::Channel(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut telemetry = self.bus.subscribe_to(Topic::Telemetry);
        let mut alerts = self.bus.subscribe_to(Topic::SystemAlerts);
        debug!(%peer, "telemetry client connected");

        loop {
            let event: Event = tokio::select! {
                event = telemetry.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                event = alerts.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                },
            };
            let json = serde_json::to_string(&event)
                .map_err(|e| EmberError::Channel(format!("telemetry encode: {e}")))?;
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        debug!(%peer, "telemetry client disconnected");
        Ok(())
    }
}
