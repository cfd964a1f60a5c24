//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use sigpost_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// Starts from defaults with an in-memory store and pacing turned off.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_chunk_bytes(16)
///     .refresh_on_hello(true)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.store.path = ":memory:".to_string();
        config.pacing.interval_ms = 0;
        Self { config }
    }

    pub fn listen(mut self, addr: &str, port: u16) -> Self {
        self.config.server.listen_addr = addr.to_string();
        self.config.server.listen_port = port;
        self
    }

    pub fn server_addr(mut self, addr: &str) -> Self {
        self.config.client.server_addr = addr.to_string();
        self
    }

    pub fn client_id(mut self, id: u64) -> Self {
        self.config.client.client_id = id;
        self
    }

    /// Point uploads and downloads below `root`.
    pub fn transfer_root(mut self, root: &Path) -> Self {
        self.config.server.upload_dir = root.join("uploads").to_string_lossy().into_owned();
        self.config.client.download_dir = root.join("downloads").to_string_lossy().into_owned();
        self
    }

    pub fn store_path(mut self, path: &Path) -> Self {
        self.config.store.path = path.to_string_lossy().into_owned();
        self
    }

    pub fn max_chunk_bytes(mut self, n: usize) -> Self {
        self.config.transfer.max_chunk_bytes = n;
        self
    }

    pub fn refresh_on_hello(mut self, refresh: bool) -> Self {
        self.config.registry.refresh_on_hello = refresh;
        self
    }

    pub fn pacing(mut self, max_burst: u32, interval_ms: u64) -> Self {
        self.config.pacing.max_burst = max_burst;
        self.config.pacing.interval_ms = interval_ms;
        self
    }

    pub fn stale_threshold_secs(mut self, secs: u64) -> Self {
        self.config.server.stale_threshold_secs = secs;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
