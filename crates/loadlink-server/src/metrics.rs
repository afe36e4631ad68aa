//! Metrics collection and export for loadlink.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use loadlink_core::IngestOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "loadlink_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "loadlink_connections_active";
    pub const FRAMES_TOTAL: &str = "loadlink_frames_total";
    pub const FRAMES_BYTES: &str = "loadlink_frames_bytes";
    pub const SAMPLES_INGESTED: &str = "loadlink_samples_ingested_total";
    pub const SAMPLES_PERSISTED: &str = "loadlink_samples_persisted_total";
    pub const RELAY_DELIVERIES: &str = "loadlink_relay_deliveries_total";
    pub const CONNECTIONS_PRUNED: &str = "loadlink_connections_pruned_total";
    pub const SESSIONS_STARTED: &str = "loadlink_sessions_started_total";
    pub const INGEST_SECONDS: &str = "loadlink_ingest_seconds";
    pub const ERRORS_TOTAL: &str = "loadlink_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::SAMPLES_INGESTED, "Samples received from producers");
    metrics::describe_counter!(names::SAMPLES_PERSISTED, "Samples written to session logs");
    metrics::describe_counter!(
        names::RELAY_DELIVERIES,
        "Batches handed to consumer connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_PRUNED,
        "Connections removed after a failed send"
    );
    metrics::describe_counter!(names::SESSIONS_STARTED, "Recording sessions started");
    metrics::describe_histogram!(names::INGEST_SECONDS, "Batch ingest latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of one ingested batch.
pub fn record_ingest(outcome: &IngestOutcome, seconds: f64) {
    counter!(names::SAMPLES_INGESTED).increment(outcome.accepted as u64);
    counter!(names::SAMPLES_PERSISTED).increment(outcome.persisted);
    counter!(names::RELAY_DELIVERIES).increment(outcome.relayed_to as u64);
    record_pruned(outcome.pruned);
    histogram!(names::INGEST_SECONDS).record(seconds);
}

/// Record connections pruned after failed sends.
pub fn record_pruned(count: usize) {
    if count > 0 {
        counter!(names::CONNECTIONS_PRUNED).increment(count as u64);
    }
}

/// Record a session start.
pub fn record_session_started() {
    counter!(names::SESSIONS_STARTED).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
