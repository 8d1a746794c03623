//! Channel-fed input plugin for sources that push rather than poll.
//!
//! Transports that receive data on their own schedule (a ROS2 scan
//! subscription, a Zenoh subscriber, an ASR websocket) hold an [`InputFeed`]
//! and push payloads into it.  The paired [`ChannelInput`] is registered
//! with an input runner like any other plugin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_types::{EmberError, ObservationPayload};
use tokio::sync::watch;

use crate::input::InputPlugin;

/// Sending half of a channel-fed input.  Cheap to clone.
///
/// Holds a single latest-value slot: a push overwrites whatever the input
/// has not yet read, so a fast producer never makes the input lag behind.
#[derive(Clone, Debug)]
pub struct InputFeed {
    source_id: String,
    tx: Arc<watch::Sender<Option<ObservationPayload>>>,
}

impl InputFeed {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Replace the pending payload with `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::Channel`] if the input side has been dropped.
    pub fn push(&self, payload: ObservationPayload) -> Result<(), EmberError> {
        self.tx
            .send(Some(payload))
            .map_err(|_| EmberError::Channel(format!("input '{}' closed", self.source_id)))
    }
}

/// Receiving half: an [`InputPlugin`] that yields the newest pushed payload.
#[derive(Debug)]
pub struct ChannelInput {
    source_id: String,
    rx: watch::Receiver<Option<ObservationPayload>>,
    min_interval: Duration,
}

/// Create a connected feed/input pair.
pub fn channel_input(
    source_id: impl Into<String>,
    min_interval: Duration,
) -> (InputFeed, ChannelInput) {
    let source_id = source_id.into();
    let (tx, rx) = watch::channel(None);
    (
        InputFeed {
            source_id: source_id.clone(),
            tx: Arc::new(tx),
        },
        ChannelInput {
            source_id,
            rx,
            min_interval,
        },
    )
}

#[async_trait]
impl InputPlugin for ChannelInput {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn acquire(&mut self) -> Result<Option<ObservationPayload>, EmberError> {
        // A value pushed before the last feed was dropped is still delivered.
        if self.rx.changed().await.is_err() {
            return Err(EmberError::InputUnavailable {
                source_id: self.source_id.clone(),
                reason: "all feeds dropped".to_string(),
            });
        }
        Ok(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> ObservationPayload {
        ObservationPayload::Text { text: s.into() }
    }

    #[tokio::test]
    async fn acquire_returns_newest_payload() {
        let (feed, mut input) = channel_input("asr", Duration::ZERO);
        feed.push(text("one")).unwrap();
        feed.push(text("two")).unwrap();
        assert_eq!(input.acquire().await.unwrap(), Some(text("two")));
    }

    #[tokio::test]
    async fn burst_of_pushes_keeps_only_the_last() {
        let (feed, mut input) = channel_input("imu", Duration::ZERO);
        for i in 0..200 {
            feed.push(text(&i.to_string())).unwrap();
        }
        assert_eq!(input.acquire().await.unwrap(), Some(text("199")));

        feed.push(text("200")).unwrap();
        assert_eq!(input.acquire().await.unwrap(), Some(text("200")));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_fresh_push() {
        let (feed, mut input) = channel_input("scan", Duration::ZERO);
        feed.push(text("a")).unwrap();
        assert_eq!(input.acquire().await.unwrap(), Some(text("a")));

        let pending = tokio::time::timeout(Duration::from_millis(50), input.acquire()).await;
        assert!(pending.is_err(), "no new payload was pushed");
    }

    #[tokio::test]
    async fn push_after_input_dropped_is_an_error() {
        let (feed, input) = channel_input("scan", Duration::ZERO);
        drop(input);
        assert!(matches!(feed.push(text("a")), Err(EmberError::Channel(_))));
    }

    #[tokio::test]
    async fn dropped_feed_makes_source_unavailable() {
        let (feed, mut input) = channel_input("social", Duration::ZERO);
        feed.push(text("last words")).unwrap();
        drop(feed);
        assert_eq!(input.acquire().await.unwrap(), Some(text("last words")));
        assert!(matches!(
            input.acquire().await,
            Err(EmberError::InputUnavailable { .. })
        ));
    }
}
