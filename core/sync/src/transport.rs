//! Remote transport seam.

use async_trait::async_trait;
use thiserror::Error;

use driftsync_common::{Error, MutationEvent, MutationSync};

/// Failure reported by a remote mutate call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Connectivity failure; the request may not have reached the backend.
    #[error("network error: {0}")]
    Network(String),

    /// The backend asked the client to slow down.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The conditional-write predicate did not hold on the backend.
    #[error("conditional check failed")]
    ConditionalCheckFailed,

    /// The backend holds a newer version and did not resolve the conflict.
    #[error("unhandled conflict with remote version {}", remote.sync_metadata.version)]
    ConflictUnhandled { remote: MutationSync },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend rejected the payload.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{message}")]
    Other { message: String, retryable: bool },
}

impl TransportError {
    /// Whether the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Throttled(_) => true,
            TransportError::Other { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Sends queued mutations to the backend.
///
/// Implementations own authentication and the wire protocol. They may apply
/// their own retry policy; the outgoing queue additionally backs off on
/// retryable errors.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name, used in logs.
    fn name(&self) -> &str;

    /// Apply one mutation remotely.
    ///
    /// # Postconditions
    /// - On success, returns the record as stored by the backend together
    ///   with its new sync metadata
    async fn mutate(&self, event: &MutationEvent) -> Result<MutationSync, TransportError>;
}
