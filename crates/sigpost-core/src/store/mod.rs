//! SQLite-backed persistence for the client registry and the mailbox.
//!
//! One database holds four record sets keyed by client id:
//! `alive_clients`, `command_pool`, `outbound_files`, and `inbound_files`.
//! Insertion order within a queue is `rowid` order.
//!
//! The connection is shared as `Arc<Mutex<Connection>>`. Every public
//! operation locks it for one short transaction and releases it before
//! returning, so callers can use the store from async tasks as long as they
//! never hold a result across the lock (they can't: the guard is private).

mod mailbox;
mod registry;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tracing::debug;

use sigpost_config::StoreConfig;

pub use mailbox::Pending;
pub use registry::ClientRecord;

/// Path value that selects a throwaway in-memory database.
pub const IN_MEMORY: &str = ":memory:";

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Errors from the store.
///
/// Any of these means "try again on the next interaction", never "nothing
/// is pending".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// Handle to the registry and mailbox database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "Opening store");
        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open whatever `store.path` names; `:memory:` gives an in-memory store.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        if config.path == IN_MEMORY {
            Self::open_in_memory()
        } else {
            Self::open(Path::new(&config.path))
        }
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={BUSY_TIMEOUT_MS};\n\
             PRAGMA synchronous=NORMAL;"
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alive_clients (
                stream_id INTEGER PRIMARY KEY,
                last_seen REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS command_pool (
                stream_id INTEGER NOT NULL,
                cmd TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outbound_files (
                stream_id INTEGER NOT NULL,
                filename TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbound_files (
                stream_id INTEGER NOT NULL,
                filename TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_command_pool_stream ON command_pool(stream_id);
            CREATE INDEX IF NOT EXISTS idx_outbound_files_stream ON outbound_files(stream_id);
            CREATE INDEX IF NOT EXISTS idx_inbound_files_stream ON inbound_files(stream_id);",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Seconds since the Unix epoch, as stored in `last_seen`.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state").join("sigpost.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.list_alive().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_queues() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sigpost.db");
        {
            let store = Store::open(&path).unwrap();
            store.enqueue_command(8, "whoami").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.take_commands(8).unwrap(), vec!["whoami".to_string()]);
    }

    #[test]
    fn test_from_config_memory() {
        let config = StoreConfig {
            path: IN_MEMORY.to_string(),
            purge_on_shutdown: true,
        };
        let store = Store::from_config(&config).unwrap();
        assert!(store.register(4).unwrap());
    }

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-01-01
        assert!(unix_now() > 1_577_836_800.0);
    }
}
