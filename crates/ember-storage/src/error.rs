//! Error types for storage backends.

use thiserror::Error;

/// Errors that can occur in a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored values could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The session id cannot be used as a storage key.
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),
}

impl From<StorageError> for ember_session::Error {
    fn from(e: StorageError) -> Self {
        ember_session::Error::Storage(e.to_string())
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
