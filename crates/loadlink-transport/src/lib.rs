//! # loadlink-transport
//!
//! Connection abstraction for the loadlink telemetry relay.
//!
//! The relay core never touches sockets directly. It holds send-capable
//! handles implementing [`Connection`]:
//!
//! - **WebSocket** - A handle onto a bounded outbound queue that the
//!   connection's own task drains into the socket
//! - **Synthetic** - An in-process connection that records what it is sent,
//!   used for tests and device simulation
//!
//! ```rust,ignore
//! use loadlink_transport::Connection;
//!
//! fn notify(conn: &dyn Connection, data: bytes::Bytes) {
//!     if let Err(e) = conn.send(data) {
//!         if e.is_disconnect() {
//!             // prune the connection
//!         }
//!     }
//! }
//! ```

pub mod synthetic;
pub mod traits;
pub mod websocket;

pub use synthetic::SyntheticConnection;
pub use traits::{Connection, ConnectionId, TransportError};
pub use websocket::{pump_outbound, OutboundQueue, WebSocketConfig, WebSocketConnection};
