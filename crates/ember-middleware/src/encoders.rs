//! Wire encoders for the supported actuator transports.
//!
//! | Encoder | Frame channel | Frame body |
//! |---|---|---|
//! | [`RosbridgeEncoder`] | ROS 2 topic | rosbridge `publish` op (`geometry_msgs/Twist`, `std_msgs/String`, or a params object) |
//! | [`ZenohEncoder`] | `<prefix>/<action>` key expression | JSON params |
//! | [`DdsEncoder`] | `rt/<prefix>/<action>` DDS topic | JSON sample with tick id |
//! | [`SerialLineEncoder`] | empty | `ACTION key=value …\n` |
//! | [`WebSocketJsonEncoder`] | empty | `{"type":"action",…}` text frame |

use std::collections::BTreeMap;

use ember_types::{ActionCommand, EmberError, ParamValue};
use serde_json::{Value, json};

use crate::transport::{CommandEncoder, Frame};

fn params_json(command: &ActionCommand) -> Value {
    let map: serde_json::Map<String, Value> = command
        .parameters()
        .iter()
        .map(|(k, v)| (k.clone(), param_json(v)))
        .collect();
    Value::Object(map)
}

fn param_json(v: &ParamValue) -> Value {
    match v {
        ParamValue::Bool(b) => json!(b),
        ParamValue::Integer(i) => json!(i),
        ParamValue::Number(n) => json!(n),
        ParamValue::String(s) => json!(s),
    }
}

fn unmapped(protocol: &str, command: &ActionCommand) -> EmberError {
    EmberError::DispatchFailure {
        target: command.target_plugin_id().to_string(),
        details: format!("{protocol}: no mapping for action '{}'", command.action_name()),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ROS 2 via rosbridge
// ────────────────────────────────────────────────────────────────────────────

/// How one action is expressed as a ROS 2 message.
#[derive(Debug, Clone, PartialEq)]
pub enum RosMessage {
    /// `geometry_msgs/msg/Twist` built from three numeric parameters.
    /// Missing parameters are sent as `0.0`.
    Twist {
        linear_x: String,
        linear_y: String,
        angular_z: String,
    },
    /// `std_msgs/msg/String` carrying one string parameter.
    Text { param: String },
    /// All parameters as the message object.
    Params,
}

/// Route of one action to a ROS 2 topic.
#[derive(Debug, Clone, PartialEq)]
pub struct RosRoute {
    pub topic: String,
    pub message: RosMessage,
}

/// Encodes commands as rosbridge v2 `publish` operations.
#[derive(Debug, Clone, Default)]
pub struct RosbridgeEncoder {
    routes: BTreeMap<String, RosRoute>,
}

impl RosbridgeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, action: impl Into<String>, topic: impl Into<String>, message: RosMessage) -> Self {
        self.routes.insert(
            action.into(),
            RosRoute {
                topic: topic.into(),
                message,
            },
        );
        self
    }
}

impl CommandEncoder for RosbridgeEncoder {
    fn protocol(&self) -> &'static str {
        "rosbridge"
    }

    fn supports(&self, action_name: &str) -> bool {
        self.routes.contains_key(action_name)
    }

    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError> {
        let route = self
            .routes
            .get(command.action_name())
            .ok_or_else(|| unmapped(self.protocol(), command))?;
        let msg = match &route.message {
            RosMessage::Twist {
                linear_x,
                linear_y,
                angular_z,
            } => {
                let p = |name: &str| command.param_f64(name).unwrap_or(0.0);
                json!({
                    "linear":  { "x": p(linear_x), "y": p(linear_y), "z": 0.0 },
                    "angular": { "x": 0.0, "y": 0.0, "z": p(angular_z) }
                })
            }
            RosMessage::Text { param } => {
                let text = command.param_str(param).ok_or_else(|| EmberError::DispatchFailure {
                    target: command.target_plugin_id().to_string(),
                    details: format!("rosbridge: string parameter '{param}' missing"),
                })?;
                json!({ "data": text })
            }
            RosMessage::Params => params_json(command),
        };
        let op = json!({
            "op": "publish",
            "topic": route.topic,
            "msg": msg,
        });
        Ok(Frame {
            channel: route.topic.clone(),
            body: op.to_string(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Zenoh
// ────────────────────────────────────────────────────────────────────────────

/// Encodes commands as Zenoh samples under `<key_prefix>/<action>`.
#[derive(Debug, Clone)]
pub struct ZenohEncoder {
    key_prefix: String,
}

impl ZenohEncoder {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl CommandEncoder for ZenohEncoder {
    fn protocol(&self) -> &'static str {
        "zenoh"
    }

    fn supports(&self, _action_name: &str) -> bool {
        true
    }

    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError> {
        Ok(Frame {
            channel: format!("{}/{}", self.key_prefix, command.action_name().replace('.', "/")),
            body: params_json(command).to_string(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DDS
// ────────────────────────────────────────────────────────────────────────────

/// Encodes commands as DDS samples on `rt/<topic_prefix>/<action>`, the
/// ROS 2 topic mangling used by CycloneDDS.
#[derive(Debug, Clone)]
pub struct DdsEncoder {
    topic_prefix: String,
}

impl DdsEncoder {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into().trim_matches('/').to_string(),
        }
    }
}

impl CommandEncoder for DdsEncoder {
    fn protocol(&self) -> &'static str {
        "dds"
    }

    fn supports(&self, _action_name: &str) -> bool {
        true
    }

    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError> {
        let topic = if self.topic_prefix.is_empty() {
            format!("rt/{}", command.action_name())
        } else {
            format!("rt/{}/{}", self.topic_prefix, command.action_name())
        };
        Ok(Frame {
            channel: topic,
            body: json!({
                "tick_id": command.tick_id(),
                "action": command.action_name(),
                "params": params_json(command),
            })
            .to_string(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Serial
// ────────────────────────────────────────────────────────────────────────────

/// Encodes commands as one ASCII line: `ACTION key=value key=value\n`.
///
/// Action names are upper-cased; parameters are emitted in name order.
/// String values are quoted with `"` and must not contain a newline.
#[derive(Debug, Clone, Default)]
pub struct SerialLineEncoder;

impl CommandEncoder for SerialLineEncoder {
    fn protocol(&self) -> &'static str {
        "serial"
    }

    fn supports(&self, _action_name: &str) -> bool {
        true
    }

    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError> {
        let mut line = command.action_name().to_ascii_uppercase();
        for (k, v) in command.parameters() {
            let value = match v {
                ParamValue::String(s) if s.contains(['\n', '\r']) => {
                    return Err(EmberError::DispatchFailure {
                        target: command.target_plugin_id().to_string(),
                        details: format!("serial: parameter '{k}' contains a line break"),
                    });
                }
                ParamValue::String(s) => format!("\"{}\"", s.replace('"', "'")),
                other => other.to_string(),
            };
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(&value);
        }
        line.push('\n');
        Ok(Frame {
            channel: String::new(),
            body: line,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket JSON
// ────────────────────────────────────────────────────────────────────────────

/// Encodes commands as JSON text frames for websocket-connected simulators
/// and robots.
#[derive(Debug, Clone, Default)]
pub struct WebSocketJsonEncoder;

impl CommandEncoder for WebSocketJsonEncoder {
    fn protocol(&self) -> &'static str {
        "websocket"
    }

    fn supports(&self, _action_name: &str) -> bool {
        true
    }

    fn encode(&self, command: &ActionCommand) -> Result<Frame, EmberError> {
        Ok(Frame {
            channel: String::new(),
            body: json!({
                "type": "action",
                "tick_id": command.tick_id(),
                "action": command.action_name(),
                "params": params_json(command),
            })
            .to_string(),
        })
    }
}
