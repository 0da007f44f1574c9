//! Storage error types.

use thiserror::Error;

/// Errors from the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    Database { reason: String },

    /// A stored JSON column could not be (de)serialized.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Requested row does not exist.
    #[error("{what} not found")]
    NotFound { what: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: e.to_string(),
        }
    }
}
