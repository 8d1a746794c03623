//! rosbridge ingest: ROS 2 topics in, observations out.
//!
//! [`RosbridgeIngest`] subscribes to a set of ROS 2 topics over a rosbridge
//! websocket and pushes each decoded message into the [`InputFeed`] of a
//! channel-fed input source.  The decision loop never sees rosbridge; it
//! sees `Scan`, `Text`, and `Structured` observations.
//!
//! Message sizes are capped before anything is allocated downstream:
//! scans with more than [`MAX_SCAN_RANGES`] readings and text messages over
//! [`MAX_TEXT_BYTES`] are refused.

use std::collections::BTreeMap;

use ember_hal::InputFeed;
use ember_types::{EmberError, LaserScan, ObservationPayload};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Maximum number of range readings accepted from one scan message.
pub const MAX_SCAN_RANGES: usize = 4096;

/// Maximum size of one text message.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

/// How messages on one topic are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosDecode {
    /// `sensor_msgs/msg/LaserScan` → [`ObservationPayload::Scan`].
    LaserScan,
    /// `std_msgs/msg/String` → [`ObservationPayload::Text`].
    Text,
    /// Any message → [`ObservationPayload::Structured`].
    Structured,
}

impl RosDecode {
    fn ros_type(self) -> &'static str {
        match self {
            RosDecode::LaserScan => "sensor_msgs/msg/LaserScan",
            RosDecode::Text => "std_msgs/msg/String",
            RosDecode::Structured => "",
        }
    }
}

struct Subscription {
    decode: RosDecode,
    feed: InputFeed,
}

/// Routes rosbridge `publish` messages to input feeds.
#[derive(Default)]
pub struct RosbridgeIngest {
    subscriptions: BTreeMap<String, Subscription>,
}

impl RosbridgeIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, topic: impl Into<String>, decode: RosDecode, feed: InputFeed) -> Self {
        self.subscriptions
            .insert(topic.into(), Subscription { decode, feed });
        self
    }

    /// rosbridge `subscribe` operations for every routed topic.
    pub fn subscribe_ops(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|(topic, sub)| {
                let mut op = json!({ "op": "subscribe", "topic": topic });
                if !sub.decode.ros_type().is_empty() {
                    op["type"] = json!(sub.decode.ros_type());
                }
                op.to_string()
            })
            .collect()
    }

    /// Decode one rosbridge text message and push it to its feed.
    ///
    /// Returns `Ok(false)` for messages that are not a `publish` on a routed
    /// topic.
    ///
    /// # Errors
    ///
    /// [`EmberError::InputUnavailable`] for malformed or oversized messages,
    /// [`EmberError::Channel`] when the feed is full or closed.
    pub fn handle(&self, text: &str) -> Result<bool, EmberError> {
        let Ok(json) = serde_json::from_str::<Value>(text) else {
            return Ok(false);
        };
        if json.get("op").and_then(Value::as_str) != Some("publish") {
            return Ok(false);
        }
        let Some(topic) = json.get("topic").and_then(Value::as_str) else {
            return Ok(false);
        };
        let Some(sub) = self.subscriptions.get(topic) else {
            return Ok(false);
        };
        let msg = json.get("msg").cloned().unwrap_or(Value::Null);
        let payload = decode(sub.decode, sub.feed.source_id(), msg)?;
        sub.feed.push(payload)?;
        Ok(true)
    }

    /// Connect to `url`, subscribe, and forward messages until `shutdown`
    /// flips to `true` or the server closes the connection.
    ///
    /// # Errors
    ///
    /// [`EmberError::Channel`] if the connection or the subscribe handshake
    /// fails.
    pub async fn run(
        &self,
        url: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EmberError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| EmberError::Channel(format!("rosbridge connect {url}: {e}")))?;
        let (mut tx, mut rx) = ws.split();
        for op in self.subscribe_ops() {
            tx.send(Message::Text(op.into()))
                .await
                .map_err(|e| EmberError::Channel(format!("rosbridge subscribe: {e}")))?;
        }
        info!(url, topics = self.subscriptions.len(), "rosbridge ingest connected");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match self.handle(text.as_str()) {
                            Ok(true) => {}
                            Ok(false) => debug!("ignoring rosbridge message"),
                            Err(e) => warn!(error = %e, "rosbridge message dropped"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(error = %e, "rosbridge connection error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode(kind: RosDecode, source_id: &str, msg: Value) -> Result<ObservationPayload, EmberError> {
    let invalid = |reason: String| EmberError::InputUnavailable {
        source_id: source_id.to_string(),
        reason,
    };
    match kind {
        RosDecode::LaserScan => {
            let ranges: Vec<f32> = msg
                .get("ranges")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("scan without ranges".into()))?
                .iter()
                // rosbridge encodes inf/NaN returns as null.
                .map(|v| v.as_f64().map_or(f32::INFINITY, |r| r as f32))
                .collect();
            if ranges.len() > MAX_SCAN_RANGES {
                return Err(invalid(format!(
                    "scan has {} ranges (max {MAX_SCAN_RANGES})",
                    ranges.len()
                )));
            }
            let field = |name: &str| msg.get(name).and_then(Value::as_f64).unwrap_or(0.0) as f32;
            Ok(ObservationPayload::Scan(LaserScan {
                ranges,
                angle_min_rad: field("angle_min"),
                angle_increment_rad: field("angle_increment"),
                range_max_m: field("range_max"),
            }))
        }
        RosDecode::Text => {
            let text = msg
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("string message without data".into()))?;
            if text.len() > MAX_TEXT_BYTES {
                return Err(invalid(format!(
                    "text message is {} bytes (max {MAX_TEXT_BYTES})",
                    text.len()
                )));
            }
            Ok(ObservationPayload::Text {
                text: text.to_string(),
            })
        }
        RosDecode::Structured => Ok(ObservationPayload::Structured { value: msg }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ember_hal::{InputPlugin, channel_input};

    use super::*;

    #[tokio::test]
    async fn scan_messages_reach_the_feed() {
        let (feed, mut input) = channel_input("lidar", Duration::from_millis(10));
        let ingest = RosbridgeIngest::new().subscribe("/scan", RosDecode::LaserScan, feed);

        let msg = r#"{"op":"publish","topic":"/scan","msg":{"angle_min":-1.5,"angle_increment":0.5,"range_max":10.0,"ranges":[2.0,null,0.8]}}"#;
        assert!(ingest.handle(msg).unwrap());

        match input.acquire().await.unwrap() {
            Some(ObservationPayload::Scan(scan)) => {
                assert_eq!(scan.ranges.len(), 3);
                assert!(scan.ranges[1].is_infinite());
                assert!((scan.angle_min_rad + 1.5).abs() < f32::EPSILON);
            }
            other => panic!("expected scan, got {other:?}"),
        }
    }

    #[test]
    fn oversized_scan_is_refused() {
        let (feed, _input) = channel_input("lidar", Duration::from_millis(10));
        let ingest = RosbridgeIngest::new().subscribe("/scan", RosDecode::LaserScan, feed);
        let msg = json!({
            "op": "publish",
            "topic": "/scan",
            "msg": { "ranges": vec![1.0; MAX_SCAN_RANGES + 1] }
        });
        let err = ingest.handle(&msg.to_string()).unwrap_err();
        assert!(matches!(err, EmberError::InputUnavailable { .. }));
    }

    #[tokio::test]
    async fn text_and_structured_topics() {
        let (asr_feed, mut asr) = channel_input("asr", Duration::from_millis(10));
        let (odom_feed, mut odom) = channel_input("odom", Duration::from_millis(10));
        let ingest = RosbridgeIngest::new()
            .subscribe("/speech", RosDecode::Text, asr_feed)
            .subscribe("/odom", RosDecode::Structured, odom_feed);

        ingest
            .handle(r#"{"op":"publish","topic":"/speech","msg":{"data":"hello robot"}}"#)
            .unwrap();
        ingest
            .handle(r#"{"op":"publish","topic":"/odom","msg":{"x":1.0}}"#)
            .unwrap();

        assert_eq!(
            asr.acquire().await.unwrap(),
            Some(ObservationPayload::Text {
                text: "hello robot".into()
            })
        );
        assert!(matches!(
            odom.acquire().await.unwrap(),
            Some(ObservationPayload::Structured { .. })
        ));
    }

    #[test]
    fn unrouted_and_non_publish_messages_are_ignored() {
        let (feed, _input) = channel_input("asr", Duration::from_millis(10));
        let ingest = RosbridgeIngest::new().subscribe("/speech", RosDecode::Text, feed);
        assert!(!ingest.handle("not json").unwrap());
        assert!(!ingest.handle(r#"{"op":"status","topic":"/speech"}"#).unwrap());
        assert!(!ingest.handle(r#"{"op":"publish","topic":"/other","msg":{}}"#).unwrap());
    }

    #[test]
    fn subscribe_ops_carry_message_types() {
        let (feed, _input) = channel_input("lidar", Duration::from_millis(10));
        let (feed2, _input2) = channel_input("odom", Duration::from_millis(10));
        let ingest = RosbridgeIngest::new()
            .subscribe("/scan", RosDecode::LaserScan, feed)
            .subscribe("/odom", RosDecode::Structured, feed2);
        let ops: Vec<Value> = ingest
            .subscribe_ops()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect();
        assert_eq!(ops[0]["topic"], "/odom");
        assert!(ops[0].get("type").is_none());
        assert_eq!(ops[1]["type"], "sensor_msgs/msg/LaserScan");
    }
}
