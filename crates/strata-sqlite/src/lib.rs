//! SQLite storage backend for Strata
//!
//! Cells live in one SQLite database file per subject destination under a
//! root directory. This crate provides:
//!
//! - [`SubjectConnection`]: one database file, serialized by a reentrant lock,
//!   committed when the outermost [`ConnectionGuard`] is released
//! - [`ConnectionCache`]: bounded LRU of open connections that creates files
//!   from a schema template
//! - [`SqliteDataStore`]: access-checked reads, writes and deletes with
//!   timestamp and regex predicate selection
//! - [`LeaseTransaction`]: single-writer leases on the lock table
//!
//! # Example
//!
//! ```rust,no_run
//! use strata_core::{StoreConfig, Timestamps, Value};
//! use strata_sqlite::SqliteDataStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteDataStore::open(StoreConfig::new("/tmp/strata"))?;
//!
//! store.set(None, "aff4:/C.1000", "hostname", "alpha", Some(1_000), true)?;
//! store.set(None, "aff4:/C.1000", "hostname", "beta", Some(2_000), true)?;
//!
//! let newest = store.resolve_multi(None, "aff4:/C.1000", &["hostname"], Timestamps::Newest, None)?;
//! assert_eq!(newest[0].value, Value::Bytes(b"beta".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Leases
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use strata_core::StoreConfig;
//! use strata_sqlite::SqliteDataStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteDataStore::open(StoreConfig::new("/tmp/strata"))?;
//!
//! let mut txn = store.transaction(None, "aff4:/C.1000", Some(Duration::from_secs(30)))?;
//! txn.set("stats.count", 3i64, None, true)?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod connection;
pub mod error;
pub mod schema;
pub mod store;
pub mod transaction;

// Re-export main types
pub use cache::ConnectionCache;
pub use connection::{ConnectionGuard, SubjectConnection};
pub use error::{Result, SqliteError};
pub use store::{Entry, SetOptions, SqliteDataStore, StoreBuilder, ValuesByPredicate};
pub use transaction::{LeaseState, LeaseTransaction};
