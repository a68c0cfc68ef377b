//! Error types for session operations.

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An empty string was used as a session id.
    #[error("Session id cannot be empty")]
    EmptySessionId,

    /// A session with this id is already cached.
    #[error("Duplicated session id: {0}")]
    DuplicatedSessionId(String),

    /// A reserved metadata key was passed to `set` or `delete`.
    #[error("Key is protected: {0}")]
    ProtectedKey(String),

    /// Session was not found and auto-creation is disabled.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Error from the storage backend.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A value could not be converted to or from plain data.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// The persisted session set could not be loaded at startup.
    #[error("Rehydration failed: {0}")]
    Rehydrate(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;
