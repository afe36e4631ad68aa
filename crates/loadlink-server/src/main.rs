//! # loadlink
//!
//! Telemetry relay between load-cell devices and dashboards, with
//! per-session CSV recording.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (0.0.0.0:5000)
//! loadlink
//!
//! # Run with a specific config file
//! LOADLINK_CONFIG=/path/to/loadlink.toml loadlink
//!
//! # Override individual settings
//! LOADLINK_PORT=8080 LOADLINK_STORAGE__DATA_DIR=/var/lib/loadlink loadlink
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use loadlink_core::SessionEvent;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadlink=info,loadlink_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    info!("Starting loadlink server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let state = std::sync::Arc::new(handlers::AppState::new(config));
    tokio::spawn(log_session_events(state.broker.subscribe_events()));

    handlers::run_server(state).await?;

    Ok(())
}

/// Log session transitions and count them.
async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Started { id, path }) => {
                metrics::record_session_started();
                info!(session = %id, path = %path.display(), "Recording started");
            }
            Ok(SessionEvent::Restarted {
                previous_id,
                previous_sample_count,
            }) => {
                warn!(
                    session = %previous_id,
                    samples = previous_sample_count,
                    "Recording restarted, previous session closed"
                );
            }
            Ok(SessionEvent::Stopped {
                id,
                sample_count,
                duration,
            }) => {
                info!(
                    session = %id,
                    samples = sample_count,
                    duration = ?duration,
                    "Recording stopped"
                );
            }
            Ok(SessionEvent::ProducerLost {
                remaining_producers,
                sample_count,
            }) => {
                warn!(
                    remaining = remaining_producers,
                    samples = sample_count,
                    "Producer disconnected during active session"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Session event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
