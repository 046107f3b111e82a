//! Error types for kvpack-state

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested entry does not exist
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Append-only stores refuse to overwrite an existing entry
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// A key component cannot be mapped onto the backend
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Record (de)serialization failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
