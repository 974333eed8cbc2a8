//! # statehub store
//!
//! Local transactional collection store for statehub, in plain and
//! encrypted variants.
//!
//! A store is a directory of CBOR files, one per collection, described by a
//! versioned manifest. Opening a store creates any collections the schema
//! added since the last run; a store that cannot be loaded is deleted and
//! recreated empty, on the premise that local data is a cache of an
//! authoritative remote. The encrypted variant namespaces the directory per
//! signed-in user and stores every record as an AES-256-GCM blob.
//!
//! [`StoreBackend`] surfaces either variant through the core crate's
//! asynchronous backend contract.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod crypto;
mod encrypted;
mod error;
mod store;

pub use adapter::StoreBackend;
pub use crypto::{AesObjectCipher, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use encrypted::EncryptedLocalStore;
pub use error::{StoreError, StoreResult};
pub use store::{LocalStore, RecordStore};
