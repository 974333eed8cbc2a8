//! Storage primitive interface and the in-memory backend.

use crate::equality::EqualityRegistry;
use crate::error::{CoreError, CoreResult};
use crate::types::{Item, StateValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The eight storage primitives a synchronous backend must provide.
///
/// Managers drive a `StateStore` by delegation: the store owns the buffer
/// and the mechanics of each mutation, while the driving manager owns event
/// emission and old-value lookup. Backends implement this trait instead of
/// subclassing a template, so composite managers can hold a list of
/// interface values.
pub trait StateStore: Send + Sync {
    /// Creates the state record for `name` if it does not exist yet.
    fn ensure_state_present(&self, name: &str);

    /// Returns the current value for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn state(&self, name: &str) -> CoreResult<StateValue>;

    /// Persists a whole value for `name`, replacing what was there.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn save_state(&self, name: &str, value: &StateValue) -> CoreResult<()>;

    /// Appends an item to the collection for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn add_item(&self, name: &str, item: &Item) -> CoreResult<()>;

    /// Removes the item matching `item` under the name's equality function.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn remove_item(&self, name: &str, item: &Item) -> CoreResult<()>;

    /// Replaces the item matching `item` under the name's equality function.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn update_item(&self, name: &str, item: &Item) -> CoreResult<()>;

    /// Replaces an already-stored named state in the underlying storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn replace_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()>;

    /// Adds a named state to the underlying storage for the first time.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be written.
    fn add_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()>;
}

/// In-memory buffer backend.
///
/// The simplest [`StateStore`]: one owned buffer per state name, splice
/// CRUD over the item sequence with pluggable equality.
pub struct MemoryStore {
    buffers: RwLock<HashMap<String, StateValue>>,
    equality: Arc<EqualityRegistry>,
}

impl MemoryStore {
    /// Creates an empty memory store.
    #[must_use]
    pub fn new(equality: Arc<EqualityRegistry>) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            equality,
        }
    }

    fn mutate_items<F>(&self, name: &str, mutate: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Vec<Item>),
    {
        let mut buffers = self.buffers.write();
        let record = buffers.entry(name.to_string()).or_default();
        let mut items = record.to_items();
        mutate(&mut items);
        *record = StateValue::Many(items);
        Ok(())
    }
}

impl StateStore for MemoryStore {
    fn ensure_state_present(&self, name: &str) {
        self.buffers
            .write()
            .entry(name.to_string())
            .or_insert(StateValue::Unset);
    }

    fn state(&self, name: &str) -> CoreResult<StateValue> {
        Ok(self
            .buffers
            .read()
            .get(name)
            .cloned()
            .unwrap_or(StateValue::Unset))
    }

    fn save_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.buffers
            .write()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    fn add_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        self.mutate_items(name, |items| items.push(item.clone()))
    }

    fn remove_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        let mut removed = false;
        self.mutate_items(name, |items| {
            if let Some(position) = items.iter().position(|existing| equals(existing, item)) {
                items.remove(position);
                removed = true;
            }
        })?;
        if removed {
            Ok(())
        } else {
            Err(CoreError::Storage(format!(
                "no matching item to remove in {name:?}"
            )))
        }
    }

    fn update_item(&self, name: &str, item: &Item) -> CoreResult<()> {
        let equals = self.equality.for_name(name);
        let mut updated = false;
        self.mutate_items(name, |items| {
            if let Some(position) = items.iter().position(|existing| equals(existing, item)) {
                items[position] = item.clone();
                updated = true;
            }
        })?;
        if updated {
            Ok(())
        } else {
            Err(CoreError::Storage(format!(
                "no matching item to update in {name:?}"
            )))
        }
    }

    fn replace_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.save_state(name, value)
    }

    fn add_named_state(&self, name: &str, value: &StateValue) -> CoreResult<()> {
        self.save_state(name, value)
    }
}
