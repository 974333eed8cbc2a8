//! The state manager contract and the synchronous driver.

use crate::equality::EqualityRegistry;
use crate::error::CoreError;
use crate::events::{ChangeDelegate, ChangeListener, StateEvent};
use crate::filter::{Filter, FilterEngine};
use crate::store::StateStore;
use crate::types::{CollectionSpec, Item, StateValue};
use std::collections::HashSet;
use std::sync::Arc;

/// The uniform CRUD/subscribe contract over one storage or transport medium.
///
/// Outcomes, including failures, are delivered through the change
/// notification mechanism; no method propagates an error across this seam.
/// Callers inspect the events they subscribed for rather than catch errors.
pub trait StateManager: Send + Sync {
    /// Returns the current value for `name`.
    ///
    /// Asynchronous managers return [`StateValue::Unset`] while a fetch is
    /// in flight and deliver the value through `StateChanged` later.
    fn state_by_name(&self, name: &str) -> StateValue;

    /// Replaces the whole value for `name`, optionally informing listeners.
    fn set_state_by_name(&self, name: &str, value: StateValue, inform: bool);

    /// Adds an item to `name`. `is_persisted` marks items that arrived from
    /// a backing store rather than a fresh user action.
    fn add_item_to_state(&self, name: &str, item: Item, is_persisted: bool);

    /// Replaces the stored item matching `item` under the name's equality.
    fn update_item_in_state(&self, name: &str, item: Item);

    /// Removes the stored item matching `item` under the name's equality.
    fn remove_item_from_state(&self, name: &str, item: Item);

    /// Identity lookup via the name's equality function.
    fn find_item_in_state(&self, name: &str, item: &Item) -> Option<Item>;

    /// Filtered query over the items of `name`.
    fn find_items_in_state(&self, name: &str, filters: &[Filter]) -> Vec<Item>;

    /// Subscribes a listener to events for `name`.
    fn add_change_listener(&self, name: &str, listener: Arc<dyn ChangeListener>);

    /// Forces the next read of `name` to hit the backing source again.
    ///
    /// A no-op for synchronous managers; asynchronous managers clear their
    /// run bookkeeping.
    fn force_reset_for_get(&self, _name: &str) {}

    /// Returns true when reads may resolve out of band.
    fn is_async(&self) -> bool {
        false
    }
}

/// Synchronous state manager driving a pluggable [`StateStore`].
///
/// The manager is solely responsible for emitting the correct event after
/// each primitive succeeds and for looking up the old value an
/// `ItemUpdated`/`ItemDeleted` event carries.
pub struct SyncManager {
    store: Arc<dyn StateStore>,
    delegate: Arc<ChangeDelegate>,
    equality: Arc<EqualityRegistry>,
    engine: FilterEngine,
    names: HashSet<String>,
}

impl SyncManager {
    /// Creates a manager over the given store for the configured collections.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        delegate: Arc<ChangeDelegate>,
        equality: Arc<EqualityRegistry>,
        specs: &[CollectionSpec],
    ) -> Self {
        Self {
            store,
            delegate,
            equality,
            engine: FilterEngine::default(),
            names: specs.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Overrides the query engine's match logic.
    #[must_use]
    pub fn with_filter_engine(mut self, engine: FilterEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Returns the delegate this manager emits through.
    #[must_use]
    pub fn delegate(&self) -> &Arc<ChangeDelegate> {
        &self.delegate
    }

    fn is_configured(&self, name: &str) -> bool {
        let configured = self.names.contains(name);
        if !configured {
            tracing::warn!(
                state = name,
                "{}",
                CoreError::NoConfiguration(name.to_string())
            );
        }
        configured
    }

    fn current_items(&self, name: &str) -> Vec<Item> {
        match self.store.state(name) {
            Ok(value) => value.to_items(),
            Err(e) => {
                tracing::warn!(state = name, error = %e, "state read failed");
                Vec::new()
            }
        }
    }
}

impl StateManager for SyncManager {
    fn state_by_name(&self, name: &str) -> StateValue {
        if !self.is_configured(name) {
            return StateValue::Unset;
        }
        self.store.ensure_state_present(name);
        match self.store.state(name) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(state = name, error = %e, "state read failed");
                StateValue::Unset
            }
        }
    }

    fn set_state_by_name(&self, name: &str, value: StateValue, inform: bool) {
        if !self.is_configured(name) {
            return;
        }
        self.store.ensure_state_present(name);

        let existed = self
            .store
            .state(name)
            .map(|current| current.is_set())
            .unwrap_or(false);
        let write = if existed {
            self.store.replace_named_state(name, &value)
        } else {
            self.store.add_named_state(name, &value)
        };
        if let Err(e) = write.and_then(|()| self.store.save_state(name, &value)) {
            tracing::warn!(state = name, error = %e, "set state failed");
            return;
        }

        if inform {
            self.delegate
                .inform(name, StateEvent::StateChanged { value: &value });
        }
    }

    fn add_item_to_state(&self, name: &str, item: Item, is_persisted: bool) {
        if !self.is_configured(name) {
            return;
        }
        self.store.ensure_state_present(name);
        if let Err(e) = self.store.add_item(name, &item) {
            tracing::warn!(state = name, error = %e, "add item failed");
            return;
        }
        self.delegate.inform(
            name,
            StateEvent::ItemAdded {
                item: &item,
                persisted: is_persisted,
            },
        );
    }

    fn update_item_in_state(&self, name: &str, item: Item) {
        if !self.is_configured(name) {
            return;
        }
        self.store.ensure_state_present(name);

        // The event needs the value being replaced, so look it up before
        // the primitive overwrites it.
        let equals = self.equality.for_name(name);
        let previous = self
            .current_items(name)
            .into_iter()
            .find(|existing| equals(existing, &item));

        if let Err(e) = self.store.update_item(name, &item) {
            tracing::warn!(state = name, error = %e, "update item failed");
            return;
        }
        self.delegate.inform(
            name,
            StateEvent::ItemUpdated {
                item: &item,
                previous: previous.as_ref(),
            },
        );
    }

    fn remove_item_from_state(&self, name: &str, item: Item) {
        if !self.is_configured(name) {
            return;
        }
        self.store.ensure_state_present(name);

        let equals = self.equality.for_name(name);
        let removed = self
            .current_items(name)
            .into_iter()
            .find(|existing| equals(existing, &item));

        if let Err(e) = self.store.remove_item(name, &item) {
            tracing::warn!(state = name, error = %e, "remove item failed");
            return;
        }
        let deleted = removed.unwrap_or(item);
        self.delegate
            .inform(name, StateEvent::ItemDeleted { item: &deleted });
    }

    fn find_item_in_state(&self, name: &str, item: &Item) -> Option<Item> {
        if !self.is_configured(name) {
            // Degrade to the raw input rather than failing.
            return Some(item.clone());
        }
        let equals = self.equality.for_name(name);
        let found = self
            .current_items(name)
            .into_iter()
            .find(|existing| equals(existing, item));
        self.delegate.inform(
            name,
            StateEvent::FindItem {
                item: found.as_ref(),
            },
        );
        found
    }

    fn find_items_in_state(&self, name: &str, filters: &[Filter]) -> Vec<Item> {
        if !self.is_configured(name) {
            return Vec::new();
        }
        let results = self.engine.apply(&self.current_items(name), filters);
        self.delegate
            .inform(name, StateEvent::FilterResults { items: &results });
        results
    }

    fn add_change_listener(&self, name: &str, listener: Arc<dyn ChangeListener>) {
        self.delegate.add_listener(name, listener);
    }
}
