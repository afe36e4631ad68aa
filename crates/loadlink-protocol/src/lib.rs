//! # loadlink-protocol
//!
//! Wire protocol definitions for the loadlink telemetry relay.
//!
//! Every WebSocket frame carries exactly one JSON object. Devices and
//! dashboards do not send an explicit message tag; the kind of an inbound
//! object is decided by which well-known key it carries.
//!
//! ## Messages
//!
//! - `{"type": ...}` - Register a connection as producer or consumer
//! - `{"samples": [...]}` - A batch of sensor readings from a producer
//! - `{"ping": true}` - Liveness check
//! - `{"cmd": ...}` - Operator command to forward to producers
//! - `{"done": true}` - Batch completion marker
//!
//! ## Example
//!
//! ```rust
//! use loadlink_protocol::{codec, ClientMessage};
//!
//! let msg = codec::decode(br#"{"samples":[{"l":5,"r":7,"t":100}]}"#).unwrap();
//! match msg {
//!     ClientMessage::Samples { samples } => assert_eq!(samples[0].l, 5),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod codec;
pub mod messages;

pub use codec::{decode, decode_samples, encode, ProtocolError};
pub use messages::{ClientMessage, Role, ServerMessage, WireSample};
