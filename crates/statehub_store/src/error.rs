//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local transactional store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O operation on the store directory failed.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or manifest could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A record or manifest could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The named collection is not part of the store's schema.
    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    /// An error bubbled up from the core layer (key extraction, cipher).
    #[error(transparent)]
    Core(#[from] statehub_core::CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::UnknownCollection("ghosts".into());
        assert!(err.to_string().contains("ghosts"));
    }
}
