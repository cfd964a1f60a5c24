#![deny(unsafe_code)]

//! Configuration loading and validation for sigpost.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure
//! shared by the server, the client, and the operator CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Protocol limits shared between configuration validation and the runtime.
pub mod limits {
    /// Exclusive upper bound for client identifiers.
    ///
    /// Identifiers are multiples of 4 below this value, which leaves roughly
    /// 2.68 * 10^10 distinct ids.
    pub const MAX_CLIENT_ID: u64 = 107_374_182_000;

    /// Largest payload a single DATA frame may carry.
    pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

    /// Smallest usable chunk size: a stock command frame carries one
    /// unsplit three-byte item delimiter.
    pub const MIN_CHUNK_BYTES: usize = 3;

    /// Default chunk size for command output and file transfers.
    pub const DEFAULT_MAX_CHUNK_BYTES: usize = 1230;
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server listener, upload directory, and staleness sweep.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client check-in loop.
    #[serde(default)]
    pub client: ClientConfig,

    /// Mailbox / registry database.
    #[serde(default)]
    pub store: StoreConfig,

    /// Client registry policy.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Payload chunking.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Outbound command pacing.
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Directory where files pulled from clients are written.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Seconds between staleness sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Clients silent for longer than this are evicted.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            upload_dir: default_upload_dir(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4433
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_stale_threshold_secs() -> u64 {
    60
}

/// Configuration for the client side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the server.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Fixed client identifier; 0 generates a fresh one at start-up.
    #[serde(default)]
    pub client_id: u64,

    /// Lower bound (inclusive) of the randomized check-in delay.
    #[serde(default = "default_checkin_min_secs")]
    pub checkin_min_secs: u64,

    /// Upper bound (exclusive) of the randomized check-in delay.
    #[serde(default = "default_checkin_max_secs")]
    pub checkin_max_secs: u64,

    /// Directory where files pushed by the server are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Per-command execution timeout in seconds (0 = no timeout).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            client_id: 0,
            checkin_min_secs: default_checkin_min_secs(),
            checkin_max_secs: default_checkin_max_secs(),
            download_dir: default_download_dir(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_server_addr() -> String {
    "127.0.0.1:4433".to_string()
}

fn default_checkin_min_secs() -> u64 {
    6
}

fn default_checkin_max_secs() -> u64 {
    9
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

/// Database location and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (`:memory:` for a throwaway store).
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Clear every queue and compact the database when the server stops.
    #[serde(default = "default_purge_on_shutdown")]
    pub purge_on_shutdown: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            purge_on_shutdown: default_purge_on_shutdown(),
        }
    }
}

fn default_store_path() -> String {
    "sigpost.db".to_string()
}

fn default_purge_on_shutdown() -> bool {
    true
}

/// Client registry policy.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Refresh `last_seen` when a known client says hello again.
    ///
    /// Off by default: a duplicate hello is rejected without touching the
    /// existing record.
    #[serde(default)]
    pub refresh_on_hello: bool,
}

/// Payload chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum payload bytes per frame for command output and files.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

fn default_max_chunk_bytes() -> usize {
    limits::DEFAULT_MAX_CHUNK_BYTES
}

/// Token-bucket pacing for command frames sent to one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Frames that may go out back-to-back before pacing kicks in.
    #[serde(default = "default_max_burst")]
    pub max_burst: u32,

    /// One token is refilled every this many milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_burst: default_max_burst(),
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_max_burst() -> u32 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading configuration");
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_port == 0 {
            return Err(ConfigError::Validation(
                "server.listen_port must be non-zero".to_string(),
            ));
        }
        if self.server.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "server.listen_addr must not be empty".to_string(),
            ));
        }
        if self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "server.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.client.server_addr.is_empty() {
            return Err(ConfigError::Validation(
                "client.server_addr must not be empty".to_string(),
            ));
        }

        let id = self.client.client_id;
        if id != 0 && (id % 4 != 0 || id >= limits::MAX_CLIENT_ID) {
            return Err(ConfigError::Validation(format!(
                "client.client_id must be a multiple of 4 below {}, got {id}",
                limits::MAX_CLIENT_ID
            )));
        }

        if self.client.checkin_min_secs >= self.client.checkin_max_secs {
            return Err(ConfigError::Validation(format!(
                "client.checkin_min_secs ({}) must be below client.checkin_max_secs ({})",
                self.client.checkin_min_secs, self.client.checkin_max_secs
            )));
        }
        // A healthy idle client has to check in before the sweep evicts it.
        if self.client.checkin_max_secs >= self.server.stale_threshold_secs {
            return Err(ConfigError::Validation(format!(
                "client.checkin_max_secs ({}) must be below server.stale_threshold_secs ({})",
                self.client.checkin_max_secs, self.server.stale_threshold_secs
            )));
        }

        let chunk = self.transfer.max_chunk_bytes;
        if !(limits::MIN_CHUNK_BYTES..=limits::MAX_FRAME_PAYLOAD).contains(&chunk) {
            return Err(ConfigError::Validation(format!(
                "transfer.max_chunk_bytes must be in {}..={}, got {chunk}",
                limits::MIN_CHUNK_BYTES,
                limits::MAX_FRAME_PAYLOAD
            )));
        }

        if self.pacing.max_burst == 0 {
            return Err(ConfigError::Validation(
                "pacing.max_burst must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.server.listen_port, 4433);
        assert_eq!(config.server.sweep_interval_secs, 5);
        assert_eq!(config.server.stale_threshold_secs, 60);
        assert_eq!(config.client.checkin_min_secs, 6);
        assert_eq!(config.client.checkin_max_secs, 9);
        assert_eq!(config.transfer.max_chunk_bytes, 1230);
        assert!(config.store.purge_on_shutdown);
        assert!(!config.registry.refresh_on_hello);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.server.listen_port, 4433);
        assert_eq!(config.client.client_id, 0);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 8443
            upload_dir = "/var/lib/sigpost/uploads"
            sweep_interval_secs = 2
            stale_threshold_secs = 120

            [client]
            server_addr = "c2.internal:8443"
            client_id = 1024
            checkin_min_secs = 10
            checkin_max_secs = 20
            download_dir = "/tmp/dl"
            command_timeout_secs = 0

            [store]
            path = ":memory:"
            purge_on_shutdown = false

            [registry]
            refresh_on_hello = true

            [transfer]
            max_chunk_bytes = 4096

            [pacing]
            max_burst = 4
            interval_ms = 250

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 8443);
        assert_eq!(config.server.stale_threshold_secs, 120);
        assert_eq!(config.client.server_addr, "c2.internal:8443");
        assert_eq!(config.client.client_id, 1024);
        assert_eq!(config.client.command_timeout_secs, 0);
        assert_eq!(config.store.path, ":memory:");
        assert!(!config.store.purge_on_shutdown);
        assert!(config.registry.refresh_on_hello);
        assert_eq!(config.transfer.max_chunk_bytes, 4096);
        assert_eq!(config.pacing.max_burst, 4);
        assert_eq!(config.pacing.interval_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let toml = r#"
            [server]
            listen_port = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_addr() {
        let toml = r#"
            [server]
            listen_addr = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_misaligned_client_id() {
        let toml = r#"
            [client]
            client_id = 1026
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_client_id_out_of_range() {
        let toml = format!("[client]\nclient_id = {}\n", limits::MAX_CLIENT_ID);
        assert!(AppConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_checkin_window() {
        let toml = r#"
            [client]
            checkin_min_secs = 9
            checkin_max_secs = 6
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_checkin_slower_than_sweep() {
        let toml = r#"
            [server]
            stale_threshold_secs = 30

            [client]
            checkin_min_secs = 20
            checkin_max_secs = 45
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("stale_threshold_secs"));
    }

    #[test]
    fn test_validation_rejects_bad_chunk_size() {
        assert!(AppConfig::parse("[transfer]\nmax_chunk_bytes = 0\n").is_err());
        assert!(AppConfig::parse("[transfer]\nmax_chunk_bytes = 2\n").is_err());
        assert!(AppConfig::parse("[transfer]\nmax_chunk_bytes = 3\n").is_ok());
        let too_big = format!(
            "[transfer]\nmax_chunk_bytes = {}\n",
            limits::MAX_FRAME_PAYLOAD + 1
        );
        assert!(AppConfig::parse(&too_big).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_burst() {
        assert!(AppConfig::parse("[pacing]\nmax_burst = 0\n").is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        assert!(AppConfig::parse("[logging]\nlevel = \"loud\"\n").is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::parse(&text).unwrap();
        assert_eq!(parsed.server.listen_port, config.server.listen_port);
        assert_eq!(parsed.store.path, config.store.path);
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sigpost.toml");
        tokio::fs::write(&path, b"[server]\nlisten_port = 4242\nlisten_addr = \"0.0.0.0\"\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.server.listen_port, 4242);
        assert_eq!(config.server.listen_addr, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test_log::test(tokio::test)]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
