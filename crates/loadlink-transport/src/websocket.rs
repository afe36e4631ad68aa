//! WebSocket connection handle.
//!
//! Each WebSocket is owned by one task that reads inbound frames. Frames
//! destined for the socket go through a bounded queue which that task
//! drains with [`pump_outbound`], so a broadcast never waits on a slow peer.

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, TransportError};

/// WebSocket connection configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Frames that may wait for the socket before new ones are skipped.
    pub outbound_queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
        }
    }
}

/// Send side of a WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    closed: Arc<Notify>,
    remote_addr: Option<SocketAddr>,
    is_open: AtomicBool,
}

/// Receive side of the outbound queue, drained by the connection task.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
    closed: Arc<Notify>,
}

impl WebSocketConnection {
    /// Create a connection handle and the queue its socket task drains.
    #[must_use]
    pub fn new(
        remote_addr: Option<SocketAddr>,
        config: &WebSocketConfig,
    ) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let closed = Arc::new(Notify::new());

        let conn = Arc::new(Self {
            id: ConnectionId::generate(),
            tx,
            closed: Arc::clone(&closed),
            remote_addr,
            is_open: AtomicBool::new(true),
        });

        (conn, OutboundQueue { rx, closed })
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                trace!(connection = %self.id, "Outbound queue full, frame skipped");
                TransportError::Backpressure
            }
            mpsc::error::TrySendError::Closed(_) => {
                self.is_open.store(false, Ordering::SeqCst);
                TransportError::ConnectionClosed
            }
        })
    }

    fn close(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            self.closed.notify_one();
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Drain the outbound queue into a WebSocket sink.
///
/// Returns when the handle is closed, every handle is dropped, or the sink
/// fails. Dropping the queue afterwards makes further sends report
/// [`TransportError::ConnectionClosed`].
pub async fn pump_outbound<S>(mut sink: S, mut queue: OutboundQueue)
where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = queue.closed.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                debug!("Outbound pump closed by handle");
                break;
            }

            frame = queue.rx.recv() => {
                let Some(data) = frame else {
                    break;
                };
                if sink.send(into_message(data)).await.is_err() {
                    debug!("Outbound pump stopped: sink failed");
                    break;
                }
            }
        }
    }
}

fn into_message(data: Bytes) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.outbound_queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_pump_delivers_in_order() {
        let (conn, queue) = WebSocketConnection::new(None, &WebSocketConfig::default());
        conn.send(Bytes::from_static(b"{\"a\":1}")).unwrap();
        conn.send(Bytes::from_static(b"{\"a\":2}")).unwrap();
        drop(conn);

        let mut sent: Vec<Message> = Vec::new();
        pump_outbound(&mut sent, queue).await;

        assert_eq!(
            sent,
            vec![
                Message::Text("{\"a\":1}".to_string()),
                Message::Text("{\"a\":2}".to_string()),
            ]
        );
    }

    #[test]
    fn test_full_queue_is_backpressure() {
        let config = WebSocketConfig {
            outbound_queue_capacity: 1,
        };
        let (conn, _queue) = WebSocketConnection::new(None, &config);

        conn.send(Bytes::from_static(b"1")).unwrap();
        let err = conn.send(Bytes::from_static(b"2")).unwrap_err();
        assert!(matches!(err, TransportError::Backpressure));
        assert!(conn.is_open());
    }

    #[test]
    fn test_dropped_queue_is_disconnect() {
        let (conn, queue) = WebSocketConnection::new(None, &WebSocketConfig::default());
        drop(queue);

        let err = conn.send(Bytes::from_static(b"1")).unwrap_err();
        assert!(err.is_disconnect());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_close_stops_pump() {
        let (conn, queue) = WebSocketConnection::new(None, &WebSocketConfig::default());
        conn.close();
        conn.close();

        let mut sent: Vec<Message> = Vec::new();
        pump_outbound(&mut sent, queue).await;

        assert_eq!(sent, vec![Message::Close(None)]);
        assert!(matches!(
            conn.send(Bytes::from_static(b"late")),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
