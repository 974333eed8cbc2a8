//! Narrow seams to the security collaborator.
//!
//! The state layer does not manage tokens or key material itself; encrypted
//! backends consume these two interfaces and nothing more.

use crate::error::CoreResult;
use serde_json::Value;

/// Encrypts and decrypts JSON objects.
pub trait ObjectCipher: Send + Sync {
    /// Encrypts a JSON value into an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or encrypted.
    fn encrypt_object(&self, value: &Value) -> CoreResult<Vec<u8>>;

    /// Decrypts a blob produced by [`Self::encrypt_object`].
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed or fails authentication.
    fn decrypt_object(&self, blob: &[u8]) -> CoreResult<Value>;
}

/// Reports the signed-in user, used to namespace encrypted storage.
pub trait UserIdentity: Send + Sync {
    /// Returns the signed-in username, if any.
    fn logged_in_username(&self) -> Option<String>;
}

/// A fixed identity, for tests and single-user deployments.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    username: Option<String>,
}

impl StaticIdentity {
    /// Creates an identity for a signed-in user.
    pub fn signed_in(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
        }
    }

    /// Creates an identity with nobody signed in.
    #[must_use]
    pub fn signed_out() -> Self {
        Self { username: None }
    }
}

impl UserIdentity for StaticIdentity {
    fn logged_in_username(&self) -> Option<String> {
        self.username.clone()
    }
}
