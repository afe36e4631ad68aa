//! The broker aggregate.
//!
//! Owns the registry, cache, session controller and pipelines, and exposes
//! every operation the server needs behind `&self` methods. There is no
//! module-level state: each broker is independent.

use loadlink_protocol::Role;
use loadlink_transport::{Connection, ConnectionId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{LatestReading, LatestReadingCache, ReadingView};
use crate::dispatcher::CommandDispatcher;
use crate::error::BrokerError;
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::recent::RecentReading;
use crate::registry::ConnectionRegistry;
use crate::relay::{DeliveryReport, RelayRouter};
use crate::sample::Batch;
use crate::session::{SessionController, SessionEvent, SessionStarted, SessionStopped};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory session logs are written to.
    pub data_dir: PathBuf,
    /// File name prefix of session logs.
    pub file_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("test_data"),
            file_prefix: "imtp_test".to_string(),
        }
    }
}

/// Connected producer and consumer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectedDevices {
    pub producer: usize,
    pub consumer: usize,
}

/// Point-in-time view of the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub esp_connected: bool,
    pub is_testing: bool,
    pub connected_devices: ConnectedDevices,
    pub latest_readings: ReadingView,
    pub session_sample_count: u64,
}

/// The recording session as shown to dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionData {
    pub is_testing: bool,
    pub sample_count: u64,
    /// Last recorded readings, oldest first.
    pub data: Vec<RecentReading>,
}

/// Relay broker: connection registry, session lifecycle, relay and persistence.
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    cache: Arc<LatestReadingCache>,
    session: Arc<SessionController>,
    dispatcher: Arc<CommandDispatcher>,
    ingest: IngestPipeline,
}

impl Broker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!(
            data_dir = %config.data_dir.display(),
            prefix = %config.file_prefix,
            "Creating broker"
        );

        let registry = Arc::new(ConnectionRegistry::new());
        let cache = Arc::new(LatestReadingCache::new());
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry)));
        let session = Arc::new(SessionController::new(
            config.data_dir,
            config.file_prefix,
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        ));
        let ingest = IngestPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&session),
            RelayRouter::new(Arc::clone(&registry)),
        );

        Self {
            registry,
            cache,
            session,
            dispatcher,
            ingest,
        }
    }

    /// Track a new connection that has not registered yet.
    pub fn connect(&self, conn: Arc<dyn Connection>) {
        self.registry.register(conn, Role::Unregistered);
    }

    /// Give a connection a role, replacing any role it held.
    pub fn register(&self, conn: Arc<dyn Connection>, role: Role) {
        let id = conn.id().clone();
        let previous = self.registry.register(conn, role);
        if previous != Some(role) {
            info!(connection = %id, role = %role, "Connection registered");
        }
    }

    /// Forget a connection. Returns the role it held.
    ///
    /// Losing a producer mid-session does not stop the session; it is
    /// reported as a [`SessionEvent::ProducerLost`].
    pub fn deregister(&self, id: &ConnectionId) -> Option<Role> {
        let role = self.registry.deregister(id)?;
        debug!(connection = %id, role = %role, "Connection removed");

        if role == Role::Producer {
            self.session
                .notify_producer_lost(self.registry.count(Role::Producer));
        }
        Some(role)
    }

    /// Process a batch of samples from `source`.
    pub fn on_batch(&self, batch: &Batch, source: Option<&ConnectionId>) -> IngestOutcome {
        self.ingest.on_batch(batch, source)
    }

    /// Start a recording session.
    ///
    /// # Errors
    ///
    /// See [`SessionController::start`].
    pub fn start(&self) -> Result<SessionStarted, BrokerError> {
        self.session.start()
    }

    /// Stop the recording session.
    ///
    /// # Errors
    ///
    /// See [`SessionController::stop`].
    pub fn stop(&self) -> Result<SessionStopped, BrokerError> {
        self.session.stop()
    }

    /// Check if a session is recording.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Push an operator command to every producer.
    pub fn send_command(&self, command: &str) -> DeliveryReport {
        self.dispatcher.send(command)
    }

    /// The most recent sample seen.
    #[must_use]
    pub fn latest_reading(&self) -> Option<LatestReading> {
        self.cache.read()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let stats = self.registry.stats();
        StatusSnapshot {
            esp_connected: stats.producers > 0,
            is_testing: self.session.is_active(),
            connected_devices: ConnectedDevices {
                producer: stats.producers,
                consumer: stats.consumers,
            },
            latest_readings: ReadingView::from(self.cache.read()),
            session_sample_count: self.session.sample_count(),
        }
    }

    /// The current or most recent session's count and last readings.
    #[must_use]
    pub fn session_data(&self) -> SessionData {
        let (sample_count, data) = self.session.recent_readings();
        SessionData {
            is_testing: self.session.is_active(),
            sample_count,
            data,
        }
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadlink_protocol::WireSample;
    use loadlink_transport::SyntheticConnection;
    use serde_json::json;

    fn broker(dir: &tempfile::TempDir) -> Broker {
        Broker::with_config(BrokerConfig {
            data_dir: dir.path().join("data"),
            file_prefix: "imtp_test".to_string(),
        })
    }

    fn join(broker: &Broker, role: Role) -> Arc<SyntheticConnection> {
        let conn = Arc::new(SyntheticConnection::new());
        broker.connect(Arc::clone(&conn) as Arc<dyn Connection>);
        broker.register(Arc::clone(&conn) as Arc<dyn Connection>, role);
        conn
    }

    fn batch(l: i64, r: i64, t: i64) -> Batch {
        let payload = format!(r#"{{"samples":[{{"l":{l},"r":{r},"t":{t}}}]}}"#);
        Batch::new(&[WireSample::new(l, r, t)], payload)
    }

    #[test]
    fn test_status_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);

        let status = serde_json::to_value(broker.status()).unwrap();
        assert_eq!(
            status,
            json!({
                "esp_connected": false,
                "is_testing": false,
                "connected_devices": {"producer": 0, "consumer": 0},
                "latest_readings": {"left": 0, "right": 0, "timestamp": null, "server_time": null},
                "session_sample_count": 0,
            })
        );
    }

    #[test]
    fn test_full_session() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let esp = join(&broker, Role::Producer);
        let app = join(&broker, Role::Consumer);

        broker.on_batch(&batch(1, 2, 3), Some(esp.id()));
        assert_eq!(app.sent_count(), 0);

        broker.start().unwrap();
        broker.on_batch(&batch(5, 7, 100), Some(esp.id()));
        broker.on_batch(&batch(6, 8, 110), Some(esp.id()));

        let status = broker.status();
        assert!(status.esp_connected);
        assert!(status.is_testing);
        assert_eq!(status.connected_devices.consumer, 1);
        assert_eq!(status.latest_readings.left, 6);
        assert_eq!(status.session_sample_count, 2);
        assert_eq!(app.sent_count(), 2);

        let stopped = broker.stop().unwrap();
        assert_eq!(stopped.sample_count, 2);
        assert_eq!(broker.status().session_sample_count, 2);

        let data = serde_json::to_value(broker.session_data()).unwrap();
        assert_eq!(
            data,
            json!({
                "is_testing": false,
                "sample_count": 2,
                "data": [
                    {"left": 5, "right": 7, "timestamp": 100},
                    {"left": 6, "right": 8, "timestamp": 110},
                ],
            })
        );
    }

    #[test]
    fn test_unregistered_connections_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let pending = Arc::new(SyntheticConnection::new());
        broker.connect(Arc::clone(&pending) as Arc<dyn Connection>);

        assert!(matches!(broker.start(), Err(BrokerError::NoProducer)));
        assert_eq!(broker.registry().len(), 1);
        assert_eq!(broker.status().connected_devices.producer, 0);
    }

    #[test]
    fn test_producer_loss_keeps_session_running() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let esp = join(&broker, Role::Producer);
        broker.start().unwrap();
        let mut events = broker.subscribe_events();

        assert_eq!(broker.deregister(esp.id()), Some(Role::Producer));
        assert_eq!(broker.deregister(esp.id()), None);

        assert!(broker.is_active());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ProducerLost {
                remaining_producers: 0,
                ..
            })
        ));
        // No producer left to receive the stop command
        assert!(matches!(broker.stop(), Err(BrokerError::NoProducer)));
    }

    #[test]
    fn test_send_command_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let esp = join(&broker, Role::Producer);

        let report = broker.send_command("calibrate 2.5kg");
        assert_eq!(report.delivered, 1);
        assert_eq!(esp.sent_json()[0], json!({"command": "calibrate 2.5kg"}));
    }
}
