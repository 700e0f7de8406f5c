//! Error types for SQLite storage backend

use rusqlite::ErrorCode;
use strata_core::StoreError;
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, SqliteError>;

/// Errors that can occur during SQLite storage operations
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Database connection or query error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Error raised by the store layer itself
    #[error(transparent)]
    Store(#[from] StoreError),

    /// IO error (for file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert SqliteError to StoreError for callers of the store facade
impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Database(rusqlite::Error::SqliteFailure(code, msg))
                if matches!(
                    code.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::StoreUnavailable(msg.unwrap_or_else(|| code.to_string()))
            }
            SqliteError::Database(rusqlite::Error::SqliteFailure(code, msg))
                if code.code == ErrorCode::NotADatabase =>
            {
                StoreError::StoreCorrupt(msg.unwrap_or_else(|| code.to_string()))
            }
            SqliteError::Database(e) => StoreError::Backend(format!("SQLite: {}", e)),
            SqliteError::Store(e) => e,
            SqliteError::Io(e) => StoreError::Io(e),
        }
    }
}
