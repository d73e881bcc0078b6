//! Error types for storage operations

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection failed
    #[error("failed to connect to storage backend: {0}")]
    ConnectionFailed(String),

    /// Database query failed
    #[error("storage query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("database migration failed: {0}")]
    MigrationFailed(String),

    /// The on-disk schema lacks a column the code writes or reads.
    ///
    /// Recoverable through `StorageBackend::repair_schema`.
    #[error("storage schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Snapshot serialization/deserialization error
    #[error("snapshot serialization error: {0}")]
    SerializationError(String),

    /// A value does not fit the column it is written to
    #[error("value out of range for {0}")]
    ValueOutOfRange(String),

    /// Referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error (file access, etc.)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Whether a database error message describes a missing column.
pub fn is_missing_column(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("no such column") || message.contains("has no column named")
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::IoError(io_err),
            sqlx::Error::RowNotFound => StorageError::NotFound("no rows found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::ConnectionFailed(err.to_string())
            }
            other => {
                let message = other.to_string();
                if is_missing_column(&message) {
                    StorageError::SchemaMismatch(message)
                } else {
                    StorageError::QueryFailed(message)
                }
            }
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}
