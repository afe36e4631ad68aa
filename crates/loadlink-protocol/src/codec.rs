//! Codec for decoding client messages and encoding server messages.
//!
//! Frames are UTF-8 JSON objects, one per WebSocket message. There is no
//! length prefix; the transport delimits frames.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::messages::{ClientMessage, ServerMessage, WireSample};

/// Maximum inbound frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Payload is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is valid JSON but not an object.
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Registration with a role the server does not know.
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// `samples` is present but not an array.
    #[error("Samples must be an array")]
    InvalidSamples,

    /// The object has no `samples` key.
    #[error("No samples in data")]
    MissingSamples,
}

/// Decode a client message from a frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, is not a JSON object, or
/// cannot be classified.
pub fn decode(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    match serde_json::from_slice::<Value>(data)? {
        Value::Object(object) => ClientMessage::from_object(&object),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Decode only the `samples` array of an object, ignoring every other key.
///
/// Used where a payload can only be a batch, so key precedence does not
/// apply.
///
/// # Errors
///
/// Returns an error if the payload is too large, is not a JSON object, has
/// no `samples` key, or `samples` is not an array.
pub fn decode_samples(data: &[u8]) -> Result<Vec<WireSample>, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    match serde_json::from_slice::<Value>(data)? {
        Value::Object(object) => object
            .get("samples")
            .ok_or(ProtocolError::MissingSamples)
            .and_then(WireSample::batch_from_value),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Encode a server message as a JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &ServerMessage) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}
