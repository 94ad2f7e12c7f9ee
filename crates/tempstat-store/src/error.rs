//! Error types for tempstat-store.

use std::path::PathBuf;

/// Result type for tempstat-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tempstat-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Device not found in database.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// One or more serial numbers are already enrolled.
    #[error("Devices with the following serial numbers already exist: {}", .0.join(", "))]
    DuplicateSerial(Vec<String>),

    /// A stored timestamp could not be decoded.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Domain validation failed.
    #[error(transparent)]
    Core(#[from] tempstat_core::Error),
}

impl Error {
    /// Whether the failure is a transient lock conflict worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
