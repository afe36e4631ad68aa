//! Server configuration.
//!
//! Settings are layered, later layers overriding earlier ones:
//! - Built-in defaults
//! - A TOML file: `LOADLINK_CONFIG` if set, otherwise the first of
//!   `loadlink.toml`, `/etc/loadlink/loadlink.toml` and
//!   `~/.config/loadlink/loadlink.toml` that exists
//! - Environment variables (`LOADLINK_PORT`, `LOADLINK_STORAGE__DATA_DIR`, ...)

use ::config::{Environment, File, FileFormat};
use anyhow::{Context, Result};
use loadlink_core::BrokerConfig;
use loadlink_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "LOADLINK";
const CONFIG_PATH_VAR: &str = "LOADLINK_CONFIG";

const CONFIG_PATHS: [&str; 3] = [
    "loadlink.toml",
    "/etc/loadlink/loadlink.toml",
    "~/.config/loadlink/loadlink.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session log storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Frames buffered per connection before new ones are skipped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Session log storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory session logs are written to.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// File name prefix of session logs.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("test_data")
}

fn default_file_prefix() -> String {
    "imtp_test".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Some(PathBuf::from(shellexpand::tilde(&path).as_ref())),
            Err(_) => Self::find_file(),
        };

        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Using config file");
        }

        Self::layered(file.as_deref(), Self::environment())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn layered(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&Config::default())
                .context("Failed to build default config")?,
        );

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder
            .add_source(env)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .context("Failed to load configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Broker settings.
    #[must_use]
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            data_dir: self.storage.data_dir.clone(),
            file_prefix: self.storage.file_prefix.clone(),
        }
    }

    /// Per-connection WebSocket settings.
    #[must_use]
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            outbound_queue_capacity: self.transport.outbound_queue_capacity,
        }
    }
}
