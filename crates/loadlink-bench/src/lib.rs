//! Shared fixtures for the loadlink benchmarks.

use bytes::Bytes;
use loadlink_core::{Batch, Broker, BrokerConfig};
use loadlink_protocol::{codec, ClientMessage, Role};
use loadlink_transport::{Connection, ConnectionId, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A connection that counts frames and drops them.
pub struct CountingConnection {
    id: ConnectionId,
    frames: AtomicU64,
}

impl CountingConnection {
    #[must_use]
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            frames: AtomicU64::new(0),
        }
    }

    /// Frames received so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Connection for CountingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, _data: Bytes) -> Result<(), TransportError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}

/// A broker writing into a temporary directory, with one producer attached.
pub struct Rig {
    pub broker: Broker,
    pub producer: Arc<CountingConnection>,
    pub consumers: Vec<Arc<CountingConnection>>,
    _dir: TempDir,
}

impl Rig {
    /// Create a rig with `consumers` consumer connections.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new(consumers: usize) -> Self {
        let dir = tempfile::tempdir().expect("create bench data dir");
        let broker = Broker::with_config(BrokerConfig {
            data_dir: dir.path().to_path_buf(),
            file_prefix: "bench".to_string(),
        });

        let producer = Arc::new(CountingConnection::new("bench-producer"));
        broker.register(Arc::clone(&producer) as Arc<dyn Connection>, Role::Producer);

        let consumers = (0..consumers)
            .map(|i| {
                let conn = Arc::new(CountingConnection::new(format!("bench-consumer-{i}")));
                broker.register(Arc::clone(&conn) as Arc<dyn Connection>, Role::Consumer);
                conn
            })
            .collect();

        Self {
            broker,
            producer,
            consumers,
            _dir: dir,
        }
    }
}

/// A `{"samples": [...]}` frame with `n` samples.
#[must_use]
pub fn samples_frame(n: usize) -> Bytes {
    let samples: Vec<_> = (0..n)
        .map(|i| serde_json::json!({"l": 1000 + i, "r": 2000 + i, "t": 50_000 + i * 10}))
        .collect();
    Bytes::from(serde_json::json!({ "samples": samples }).to_string())
}

/// Decode a samples frame into a batch.
///
/// # Panics
///
/// Panics if `frame` is not a samples frame.
#[must_use]
pub fn batch_from(frame: &Bytes) -> Batch {
    match codec::decode(frame).expect("decode bench frame") {
        ClientMessage::Samples { samples } => Batch::new(&samples, frame.clone()),
        other => panic!("not a samples frame: {:?}", other),
    }
}
