//! Store fixtures.
//!
//! [`TestStore`] opens a file-backed [`Store`] inside a temporary directory
//! that also serves as scratch space for transfer files.

use std::path::{Path, PathBuf};

use sigpost_core::Store;
use tempfile::TempDir;

/// A store plus the temp directory that owns its database file.
///
/// The directory is deleted when this value is dropped, even on panic.
pub struct TestStore {
    pub store: Store,
    pub db_path: PathBuf,
    dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db_path = dir.path().join("sigpost.db");
        let store = Store::open(&db_path).expect("failed to open test store");
        Self {
            store,
            db_path,
            dir,
        }
    }

    /// Root of the temp directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` under the temp directory and return its path.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("failed to write fixture file");
        path
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}
