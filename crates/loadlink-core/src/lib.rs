//! # loadlink-core
//!
//! Connection registry, session lifecycle, relay and persistence for the
//! loadlink telemetry relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - Live connections and the role each one holds
//! - **LatestReadingCache** - The most recent sample, regardless of session state
//! - **SessionController** - Idle/Active state machine owning the session log
//! - **PersistenceWriter** - Append-only CSV log for one session
//! - **RecentReadings** - The last readings recorded in the session
//! - **IngestPipeline** - Applies producer batches to cache, log and relay
//! - **RelayRouter** - Best-effort fan-out of batches to consumers
//! - **CommandDispatcher** - Pushes operator commands to producers
//! - **Broker** - The aggregate that owns all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌───────────────┐    ┌─────────────────────┐
//! │  Producer  │───▶│ IngestPipeline│───▶│ LatestReadingCache  │
//! └────────────┘    └───────────────┘    └─────────────────────┘
//!                          │   │
//!            (Active only) │   └────────▶┌─────────────────────┐
//!                          ▼             │ RelayRouter ──▶ consumers
//!                  ┌───────────────┐     └─────────────────────┘
//!                  │PersistenceWriter│
//!                  └───────────────┘
//!                          ▲
//! ┌────────────┐    ┌───────────────────┐    ┌───────────────────┐
//! │  Operator  │───▶│ SessionController │───▶│ CommandDispatcher │──▶ producers
//! └────────────┘    └───────────────────┘    └───────────────────┘
//! ```

pub mod broker;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod ingest;
pub mod persistence;
pub mod recent;
pub mod registry;
pub mod relay;
pub mod sample;
pub mod session;

pub use broker::{Broker, BrokerConfig, ConnectedDevices, SessionData, StatusSnapshot};
pub use cache::{LatestReading, LatestReadingCache, ReadingView};
pub use dispatcher::CommandDispatcher;
pub use error::BrokerError;
pub use ingest::{IngestOutcome, IngestPipeline};
pub use persistence::{PersistenceError, PersistenceWriter, CSV_HEADER};
pub use recent::{RecentReading, RecentReadings, RECENT_CAPACITY};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use relay::{DeliveryReport, RelayRouter};
pub use sample::{Batch, Sample};
pub use session::{
    SessionController, SessionEvent, SessionStarted, SessionState, SessionStopped,
};
