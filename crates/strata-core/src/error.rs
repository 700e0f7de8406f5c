//! Storage error types

use thiserror::Error;

/// Errors surfaced by every store operation
#[derive(Debug, Error)]
pub enum StoreError {
    /// The access gate rejected the operation
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Lease contention: the subject is locked or the lock was lost to a racing acquirer
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A database file did not become readable within the bounded wait
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// On-disk layout is not what the store expects
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    /// A stored cell does not match its declared type hint
    #[error("cannot decode {predicate} as {hint}: {reason}")]
    Decode {
        predicate: String,
        hint: String,
        reason: String,
    },

    /// Predicate pattern is not a valid regular expression
    #[error("invalid predicate pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The connection was used after it was closed
    #[error("connection to {0} is closed")]
    Closed(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend error (database driver)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// IO error (for file operations)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Lease contention and transient file unavailability may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transaction(_) | StoreError::StoreUnavailable(_))
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
