//! Error types for the artifact store layer

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by artifact store backends
#[derive(Error, Debug)]
pub enum StoreError {
    /// Key not present in the store
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// Underlying filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure (HTTP status, connection loss, ...)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Artifacts root URI is not recognised by any backend
    #[error("invalid artifacts root: {0}")]
    InvalidRoot(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}
