//! Connection capability trait for loadlink.
//!
//! A connection is anything the relay can push a frame to. Sending never
//! waits on the peer: implementations either enqueue or fail immediately.

use bytes::Bytes;
use loadlink_protocol::{codec, ServerMessage};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer is not draining its outbound queue fast enough.
    #[error("Outbound queue full")]
    Backpressure,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] loadlink_protocol::ProtocolError),
}

impl TransportError {
    /// Whether the error means the connection is gone.
    ///
    /// Backpressure only costs the peer the frame that did not fit.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::SendFailed(_)
        )
    }
}

/// A live connection the relay can push frames to.
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Send a pre-encoded frame.
    ///
    /// Must not block on network I/O.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Encode and send a server message.
    fn send_message(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let data = codec::encode(message)?;
        self.send(data)
    }

    /// Close the connection. Closing twice is a no-op.
    fn close(&self);

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
