//! Store configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Default number of open database connections kept in the cache
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Default transaction lease, in seconds
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 600;

/// Default wait for a freshly created database file to become readable
pub const DEFAULT_READABLE_TIMEOUT_MS: u64 = 3_000;

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 60_000;

/// Configuration of a file-per-subject store.
///
/// Every field has a default, so a config file only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one database file per destination
    pub root_path: PathBuf,
    /// Maximum number of open connections
    pub cache_size: usize,
    /// Lease granted to transactions that do not ask for one
    pub transaction_timeout_secs: u64,
    /// Bounded wait for a database file created by another writer
    pub readable_timeout_ms: u64,
    /// How long SQLite retries a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("strata-data"),
            cache_size: DEFAULT_CACHE_SIZE,
            transaction_timeout_secs: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            readable_timeout_ms: DEFAULT_READABLE_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `root_path` with default limits.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.cache_size == 0 {
            return Err(StoreError::Config("cache_size must be positive".to_string()));
        }
        if self.root_path.as_os_str().is_empty() {
            return Err(StoreError::Config("root_path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn readable_timeout(&self) -> Duration {
        Duration::from_millis(self.readable_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
