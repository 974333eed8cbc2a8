//! Error types for the remote layer.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur talking to a remote backend.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The server did not answer or answered with a 500-class status.
    ///
    /// Routed to the offline manager rather than reported as an ordinary
    /// failure.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server rejected the call with a 403-class status.
    #[error("authentication expired")]
    AuthExpired,

    /// A read-class request was issued while the server is known offline.
    #[error("read rejected while offline")]
    OfflineReadRejected,

    /// A request or response payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// No remote configuration exists for the named collection.
    #[error("no remote configuration for state {0:?}")]
    NoConfiguration(String),

    /// The transport itself failed before a status was received.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An error bubbled up from the core layer.
    #[error(transparent)]
    Core(#[from] statehub_core::CoreError),

    /// An error bubbled up from the local store.
    #[error(transparent)]
    Store(#[from] statehub_store::StoreError),
}

impl RemoteError {
    /// Returns true for failures a later retry may resolve.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_) | RemoteError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}
