//! Errors surfaced to control-plane callers.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Broker errors.
///
/// Per-connection failures never show up here: they are contained to the
/// connection or the single sample they affect.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No producer is connected to receive the command.
    #[error("No ESP32 device connected")]
    NoProducer,

    /// The session log could not be created.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
