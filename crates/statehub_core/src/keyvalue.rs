//! Key-value persisted backends.
//!
//! These backends persist each named state as one serialized string in a
//! flat key/value store, the way browser-local storage works: every
//! mutation is a whole-collection read-modify-write with a JSON round-trip.
//! The encrypted variant namespaces keys per signed-in user and encrypts
//! the serialized value before write.

use crate::equality::EqualityRegistry;
use crate::error::{CoreError, CoreResult};
use crate::security::{ObjectCipher, UserIdentity};
use crate::store::StateStore;
use crate::types::{Item, StateValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A flat string key/value store.
pub trait KeyValueBackend: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: String);

    /// Removes the value stored under `key`.
    fn remove(&self, key: &str);
}

/// In-process [`KeyValueBackend`], used in tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKeyValueBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw stored string for a key, for inspection.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }
}

impl KeyValueBackend for MemoryKeyValueBackend {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

fn splice_add(items: &mut Vec<Item>, item: &Item) {
    items.push(item.clone());
}

fn splice_remove(
    items: &mut Vec<Item>,
    item: &Item,
    equals: &crate::equality::EqualityFn,
    name: &str,
) -> CoreResult<()> {
    match items.iter().position(|existing| equals(existing, item)) {
        Some(position) => {
            items.remove(position);
            Ok(())
        }
        None => Err(CoreError::Storage(format!(
            "no matching item to remove in {name:?}"
        ))),
    }
}

fn splice_update(
    items: &mut [Item],
    item: &Item,
    equals: &crate::equality::EqualityFn,
    name: &str,
) -> CoreResult<()> {
    match items.iter().position(|existing| equals(existing, item)) {
        Some(position) => {
            items[position] = item.clone();
            Ok(())
        }
        None => Err(CoreError::Storage(format!(
            "no matching item to update in {name:?}"
        ))),
    }
}

/// Plain key-value persisted backend.
pub struct KeyValueStore {
    backend: Arc<dyn KeyValueBackend>,
    equality: Arc<EqualityRegistry>,
    prefix: String,
}

impl KeyValueStore {
    /// Creates a store over the backend with the default `statehub` prefix.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, equality: Arc<EqualityRegistry>) -> Self {
        Self::with_prefix(backend, equality, "statehub")
    }

    /// Creates a store with a custom key prefix.
    #[must_use]
    pub fn with_prefix(
        backend: Arc<dyn KeyValueBackend>,
        equality: Arc<EqualityRegistry>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            equality,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}::{}", self.prefix, name)
    }

    fn read(&self, name: &str) -> CoreResult<StateValue> {
        match self.backend.get(&self.key(name)) {
            Some(serialized) => Ok(serde_json::from_str(&serialized)?),
            None => Ok(StateValue::Unset),
        }
    }

    fn write(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        let serialized = serde_json::to_string(value)?;
        self.backend.set(&self.key(name), serialized);
        Ok(())
    }

    fn read_modify_write<F>(&self, name: &str, mutate: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Vec<Item>) -> CoreResult<()>,
    {
        let mut items = self.read(name)?.to_items();
        mutate(&mut items)?;
        self.write(name, &StateValue::Many(items))
    }
}

impl StateStore for KeyValueStore {
    fn ensure_state_present(&self, name: &str) {
        if self.backend.get(&self.key(name)).is_none() {
            if let Err(e) = self.write(name, &StateValue::Unset) {
                tracing::warn!(state = name, error = %e, "ensure state failed");
            }
        }
    }

    fn state(&self, name: &str) -> CoreResult<StateValue> {
        self.read(name)
    }

    fn save_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }

    fn add_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        self.read_modify_write(name, |items| {
            splice_add(items, item);
            Ok(())
        })
    }

    fn remove_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        self.read_modify_write(name, |items| splice_remove(items, item, &equals, name))
    }

    fn update_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        self.read_modify_write(name, |items| splice_update(items, item, &equals, name))
    }

    fn replace_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }

    fn add_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }
}

/// Encrypted key-value persisted backend.
///
/// Keys are namespaced per signed-in user; the serialized state is run
/// through the [`ObjectCipher`] before write and after read, stored as hex.
pub struct EncryptedKeyValueStore {
    backend: Arc<dyn KeyValueBackend>,
    equality: Arc<EqualityRegistry>,
    cipher: Arc<dyn ObjectCipher>,
    identity: Arc<dyn UserIdentity>,
    prefix: String,
}

impl EncryptedKeyValueStore {
    /// Creates an encrypted store over the backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        equality: Arc<EqualityRegistry>,
        cipher: Arc<dyn ObjectCipher>,
        identity: Arc<dyn UserIdentity>,
    ) -> Self {
        Self {
            backend,
            equality,
            cipher,
            identity,
            prefix: "statehub".to_string(),
        }
    }

    fn key(&self, name: &str) -> CoreResult<String> {
        let user = self
            .identity
            .logged_in_username()
            .ok_or(CoreError::NoSignedInUser)?;
        Ok(format!("{}::{}::{}", self.prefix, user, name))
    }

    fn read(&self, name: &str) -> CoreResult<StateValue> {
        let Some(encoded) = self.backend.get(&self.key(name)?) else {
            return Ok(StateValue::Unset);
        };
        let blob = hex::decode(&encoded)
            .map_err(|e| CoreError::Serialization(format!("bad hex payload: {e}")))?;
        let value = self.cipher.decrypt_object(&blob)?;
        Ok(serde_json::from_value(value)?)
    }

    fn write(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        let key = self.key(name)?;
        let plain = serde_json::to_value(value)?;
        let blob = self.cipher.encrypt_object(&plain)?;
        self.backend.set(&key, hex::encode(blob));
        Ok(())
    }

    fn read_modify_write<F>(&self, name: &str, mutate: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Vec<Item>) -> CoreResult<()>,
    {
        let mut items = self.read(name)?.to_items();
        mutate(&mut items)?;
        self.write(name, &StateValue::Many(items))
    }
}

impl StateStore for EncryptedKeyValueStore {
    fn ensure_state_present(&self, name: &str) {
        let present = self
            .key(name)
            .map(|key| self.backend.get(&key).is_some())
            .unwrap_or(false);
        if !present {
            if let Err(e) = self.write(name, &StateValue::Unset) {
                tracing::warn!(state = name, error = %e, "ensure state failed");
            }
        }
    }

    fn state(&self, name: &str) -> CoreResult<StateValue> {
        self.read(name)
    }

    fn save_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }

    fn add_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        self.read_modify_write(name, |items| {
            splice_add(items, item);
            Ok(())
        })
    }

    fn remove_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        self.read_modify_write(name, |items| splice_remove(items, item, &equals, name))
    }

    fn update_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        self.read_modify_write(name, |items| splice_update(items, item, &equals, name))
    }

    fn replace_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }

    fn add_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.write(name, value)
    }
}
