//! Error types for the core state layer.

use thiserror::Error;

/// Result type for core state operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur inside the state layer.
///
/// These errors never cross the public [`crate::StateManager`] contract:
/// managers log them and degrade, delivering outcomes through the change
/// notification mechanism instead.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No backend is configured for the requested state name.
    #[error("no configuration for state name {0:?}")]
    NoConfiguration(String),

    /// An item is missing the key field its collection is keyed by.
    #[error("item is missing key field {key_field:?} for collection {collection:?}")]
    MissingKeyField {
        /// Collection name.
        collection: String,
        /// Configured key field.
        key_field: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// An encrypt/decrypt operation failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// No user is signed in, so a per-user namespace cannot be derived.
    #[error("no signed-in user for namespaced storage")]
    NoSignedInUser,

    /// An underlying storage primitive failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::NoConfiguration("users".into());
        assert!(err.to_string().contains("users"));

        let err = CoreError::MissingKeyField {
            collection: "tasks".into(),
            key_field: "taskId".into(),
        };
        assert!(err.to_string().contains("taskId"));
    }
}
