//! In-process synthetic connection.
//!
//! Records every frame sent to it instead of writing to a socket, and can be
//! told to fail sends to stand in for a peer that has gone away.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::traits::{Connection, ConnectionId, TransportError};

/// A connection with no socket behind it.
#[derive(Debug)]
pub struct SyntheticConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Bytes>>,
    fail_sends: AtomicBool,
    is_open: AtomicBool,
}

impl SyntheticConnection {
    /// Create a synthetic connection with a generated ID.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ConnectionId::generate())
    }

    /// Create a synthetic connection with a specific ID.
    #[must_use]
    pub fn with_id(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            is_open: AtomicBool::new(true),
        }
    }

    /// Make every subsequent send fail as if the peer had vanished.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Frames sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames sent so far, parsed as JSON. Frames that are not JSON are skipped.
    #[must_use]
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// Number of frames sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SyntheticConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for SyntheticConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "synthetic connection {} rejected frame",
                self.id
            )));
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
        Ok(())
    }

    fn close(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            debug!(connection = %self.id, "Synthetic connection closed");
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        Some("synthetic".to_string())
    }
}
