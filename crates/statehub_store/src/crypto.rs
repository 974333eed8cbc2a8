//! AES-256-GCM object cipher.
//!
//! Implements the core crate's [`ObjectCipher`] seam over authenticated
//! encryption. Output format: `nonce (12 bytes) || ciphertext || tag (16
//! bytes)`. Keys are zeroized on drop.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde_json::Value;
use statehub_core::{CoreError, CoreResult, ObjectCipher};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit key for the object cipher.
///
/// Key material is wiped from memory when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Builds a key from existing key material.
    ///
    /// # Errors
    ///
    /// Fails unless `bytes` is exactly [`KEY_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CoreError::Cipher(format!(
                "invalid key size {}, expected {KEY_SIZE}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a password and salt via HKDF-SHA256.
    ///
    /// The same password and salt always yield the same key; pick the salt
    /// randomly per deployment and store it next to the encrypted data.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> CoreResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), password);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"statehub-object-cipher-v1", &mut bytes)
            .map_err(|_| CoreError::Cipher("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM implementation of the [`ObjectCipher`] seam.
pub struct AesObjectCipher {
    cipher: Aes256Gcm,
}

impl AesObjectCipher {
    /// Wraps `key` in an AES-256-GCM cipher.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        // The key length is fixed at KEY_SIZE, so from_slice cannot fail.
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }

    fn encrypt_bytes(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CoreError::Cipher("encryption error".into()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt_bytes(&self, blob: &[u8]) -> CoreResult<Vec<u8>> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::Cipher("ciphertext too short".into()));
        }
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map_err(|_| CoreError::Cipher("decryption error".into()))
    }
}

impl std::fmt::Debug for AesObjectCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesObjectCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

impl ObjectCipher for AesObjectCipher {
    fn encrypt_object(&self, value: &Value) -> CoreResult<Vec<u8>> {
        let mut plain = Vec::new();
        ciborium::into_writer(value, &mut plain)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.encrypt_bytes(&plain)
    }

    fn decrypt_object(&self, blob: &[u8]) -> CoreResult<Value> {
        let plain = self.decrypt_bytes(blob)?;
        ciborium::from_reader(plain.as_slice())
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
