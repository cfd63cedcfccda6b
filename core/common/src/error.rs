//! Common error types for driftsync.

use thiserror::Error;

/// Top-level error type for driftsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Remote and local state disagree and could not be reconciled.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A local mutation was rejected by the outbox disposition rules.
    #[error("Mutation rejected: {0}")]
    Disposition(String),

    /// A payload could not be decoded as the expected model.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The remote transport reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A component was used before it was wired up correctly.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
