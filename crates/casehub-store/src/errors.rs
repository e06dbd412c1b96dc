//! Error types for the SQLite message store.

use casehub_hub::StoreError;
use thiserror::Error;

/// Errors raised by the SQLite backend.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Filesystem error preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be mapped back to a message.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The blocking task running a query was cancelled or panicked.
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, SqliteStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = SqliteStoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn migration_error_display() {
        let err = SqliteStoreError::Migration {
            message: "v1 failed".into(),
        };
        assert_eq!(err.to_string(), "migration error: v1 failed");
    }

    #[test]
    fn converts_to_backend_store_error() {
        let err: StoreError = SqliteStoreError::CorruptRow("bad timestamp".into()).into();
        match err {
            StoreError::Backend(message) => assert!(message.contains("bad timestamp")),
            StoreError::MessageNotFound(_) => panic!("expected backend error"),
        }
    }
}
