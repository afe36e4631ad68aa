//! Message types for the loadlink protocol.
//!
//! Inbound objects are classified by key, checked in a fixed order:
//! `type`, `samples`, `ping`, `cmd`, `done`. The first key present wins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// Role a connection holds in the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Telemetry source (the sensor device).
    Producer,
    /// Observer (dashboard or mobile app).
    Consumer,
    /// Connected but not yet registered.
    Unregistered,
}

impl Role {
    /// Map a role string sent by a client to a role.
    ///
    /// Besides the canonical names this accepts the names deployed firmware
    /// and apps use (`esp32`, `esp`, `flutter`, `browser`).
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "producer" | "esp32" | "esp" => Some(Role::Producer),
            "consumer" | "flutter" | "browser" => Some(Role::Consumer),
            _ => None,
        }
    }

    /// Canonical name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Unregistered => "unregistered",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reading as sent by a producer: `{"l": .., "r": .., "t": ..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireSample {
    /// Left sensor value.
    pub l: i64,
    /// Right sensor value.
    pub r: i64,
    /// Device clock in milliseconds.
    pub t: i64,
}

impl WireSample {
    /// Create a sample.
    #[must_use]
    pub const fn new(l: i64, r: i64, t: i64) -> Self {
        Self { l, r, t }
    }

    /// Normalize an arbitrary JSON value into a sample.
    ///
    /// Missing or non-numeric fields become `0`; a value that is not an
    /// object yields an all-zero sample. Samples are never rejected.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &str| value.get(key).map(integer_or_zero).unwrap_or(0);
        Self {
            l: field("l"),
            r: field("r"),
            t: field("t"),
        }
    }

    /// Normalize a `samples` array.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidSamples`] if `value` is not an array.
    pub fn batch_from_value(value: &Value) -> Result<Vec<Self>, ProtocolError> {
        let items = value.as_array().ok_or(ProtocolError::InvalidSamples)?;
        Ok(items.iter().map(Self::from_value).collect())
    }
}

fn integer_or_zero(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

/// A message received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Registration as producer or consumer.
    Register {
        /// Resolved role.
        role: Role,
        /// The role string exactly as the client sent it.
        declared: String,
    },

    /// A batch of samples, in arrival order.
    Samples {
        /// Normalized samples.
        samples: Vec<WireSample>,
    },

    /// Liveness check.
    Ping,

    /// Operator command to forward to producers.
    Command {
        /// Command text, passed through verbatim.
        cmd: String,
    },

    /// Batch completion marker.
    Done,

    /// A JSON object with none of the known keys.
    Unknown,
}

impl ClientMessage {
    /// Classify a decoded JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object registers an unknown role or carries
    /// a `samples` value that is not an array.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, ProtocolError> {
        if let Some(kind) = object.get("type") {
            let declared = text_of(kind);
            let role = Role::from_wire(&declared)
                .ok_or_else(|| ProtocolError::UnknownRole(declared.clone()))?;
            return Ok(ClientMessage::Register { role, declared });
        }

        if let Some(samples) = object.get("samples") {
            return Ok(ClientMessage::Samples {
                samples: WireSample::batch_from_value(samples)?,
            });
        }

        if object.contains_key("ping") {
            return Ok(ClientMessage::Ping);
        }

        if let Some(cmd) = object.get("cmd") {
            return Ok(ClientMessage::Command { cmd: text_of(cmd) });
        }

        if object.contains_key("done") {
            return Ok(ClientMessage::Done);
        }

        Ok(ClientMessage::Unknown)
    }

    /// Short name of the message kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Samples { .. } => "samples",
            ClientMessage::Ping => "ping",
            ClientMessage::Command { .. } => "cmd",
            ClientMessage::Done => "done",
            ClientMessage::Unknown => "unknown",
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Registration accepted.
    Registered {
        /// Always `"registered"`.
        status: String,
        /// The role string the client registered with.
        #[serde(rename = "type")]
        kind: String,
        /// Optional hint for the client.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Reply to a ping.
    Pong {
        /// Always `true`.
        pong: bool,
    },

    /// Acknowledgment of an operator command.
    CommandAck {
        /// The command that was dispatched.
        command_ack: String,
        /// Always `true`.
        success: bool,
    },

    /// Command pushed to producers.
    Command {
        /// Command text.
        command: String,
    },
}

impl ServerMessage {
    /// Create a Registered reply.
    #[must_use]
    pub fn registered(kind: impl Into<String>, message: Option<String>) -> Self {
        ServerMessage::Registered {
            status: "registered".to_string(),
            kind: kind.into(),
            message,
        }
    }

    /// Create a Pong reply.
    #[must_use]
    pub fn pong() -> Self {
        ServerMessage::Pong { pong: true }
    }

    /// Create a CommandAck reply.
    #[must_use]
    pub fn command_ack(command: impl Into<String>) -> Self {
        ServerMessage::CommandAck {
            command_ack: command.into(),
            success: true,
        }
    }

    /// Create a Command message for producers.
    #[must_use]
    pub fn command(command: impl Into<String>) -> Self {
        ServerMessage::Command {
            command: command.into(),
        }
    }
}
