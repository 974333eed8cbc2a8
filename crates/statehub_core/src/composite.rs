//! Composite managers: aggregate fan-out and the async-to-sync bridge.

use crate::events::ChangeListener;
use crate::filter::Filter;
use crate::manager::StateManager;
use crate::types::{Item, StateValue};
use std::collections::HashSet;
use std::sync::Arc;

struct AggregateChild {
    manager: Arc<dyn StateManager>,
    excluded: HashSet<String>,
}

impl AggregateChild {
    fn handles(&self, name: &str) -> bool {
        !self.excluded.contains(name)
    }
}

/// Fans a single call out to N backend managers.
///
/// Each child carries an optional exclusion list of state names it should
/// not receive. For read operations the first non-excluded child's return
/// value is canonical; writes and listener registrations reach every
/// non-excluded child.
///
/// This lets a UI compose "remote source" + "local cache" + "in-memory
/// projection" without each layer knowing the others' synchrony.
#[derive(Default)]
pub struct AggregateManager {
    children: Vec<AggregateChild>,
}

impl AggregateManager {
    /// Creates an empty aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child manager that receives every state name.
    #[must_use]
    pub fn with_manager(self, manager: Arc<dyn StateManager>) -> Self {
        self.with_manager_excluding(manager, &[])
    }

    /// Adds a child manager that never receives the excluded names.
    #[must_use]
    pub fn with_manager_excluding(
        mut self,
        manager: Arc<dyn StateManager>,
        excluded: &[&str],
    ) -> Self {
        self.children.push(AggregateChild {
            manager,
            excluded: excluded.iter().map(|n| (*n).to_string()).collect(),
        });
        self
    }

    fn first_for(&self, name: &str) -> Option<&Arc<dyn StateManager>> {
        self.children
            .iter()
            .find(|child| child.handles(name))
            .map(|child| &child.manager)
    }

    fn each_for<F>(&self, name: &str, mut apply: F)
    where
        F: FnMut(&Arc<dyn StateManager>),
    {
        for child in &self.children {
            if child.handles(name) {
                apply(&child.manager);
            }
        }
    }
}

impl StateManager for AggregateManager {
    fn state_by_name(&self, name: &str) -> StateValue {
        self.first_for(name)
            .map(|manager| manager.state_by_name(name))
            .unwrap_or(StateValue::Unset)
    }

    fn set_state_by_name(&self, name: &str, value: StateValue, inform: bool) {
        self.each_for(name, |manager| {
            manager.set_state_by_name(name, value.clone(), inform);
        });
    }

    fn add_item_to_state(&self, name: &str, item: Item, is_persisted: bool) {
        self.each_for(name, |manager| {
            manager.add_item_to_state(name, item.clone(), is_persisted);
        });
    }

    fn update_item_in_state(&self, name: &str, item: Item) {
        self.each_for(name, |manager| {
            manager.update_item_in_state(name, item.clone());
        });
    }

    fn remove_item_from_state(&self, name: &str, item: Item) {
        self.each_for(name, |manager| {
            manager.remove_item_from_state(name, item.clone());
        });
    }

    fn find_item_in_state(&self, name: &str, item: &Item) -> Option<Item> {
        self.first_for(name)
            .and_then(|manager| manager.find_item_in_state(name, item))
    }

    fn find_items_in_state(&self, name: &str, filters: &[Filter]) -> Vec<Item> {
        self.first_for(name)
            .map(|manager| manager.find_items_in_state(name, filters))
            .unwrap_or_default()
    }

    fn add_change_listener(&self, name: &str, listener: Arc<dyn ChangeListener>) {
        self.each_for(name, |manager| {
            manager.add_change_listener(name, listener.clone());
        });
    }

    fn force_reset_for_get(&self, name: &str) {
        self.each_for(name, |manager| manager.force_reset_for_get(name));
    }

    fn is_async(&self) -> bool {
        self.children.iter().any(|child| child.manager.is_async())
    }
}

/// Bridges an asynchronous backend into a synchronous parent.
///
/// The bridge subscribes to every configured state name of the wrapped
/// manager and re-emits its events upward: an item added with
/// `is_persisted = true` becomes a whole-state set on the parent, so a
/// backend that resolves out of band still satisfies the synchronous
/// contract the parent expects.
pub struct AsyncBridge {
    parent: Arc<dyn StateManager>,
}

impl AsyncBridge {
    /// Subscribes a new bridge to `wrapped` for each name and returns it.
    pub fn connect(
        wrapped: &dyn StateManager,
        parent: Arc<dyn StateManager>,
        names: &[&str],
    ) -> Arc<Self> {
        let bridge = Arc::new(Self { parent });
        for name in names {
            wrapped.add_change_listener(name, bridge.clone());
        }
        bridge
    }
}

impl ChangeListener for AsyncBridge {
    fn item_added(&self, name: &str, item: &Item, persisted: bool) {
        if persisted {
            self.parent
                .set_state_by_name(name, StateValue::One(item.clone()), true);
        } else {
            self.parent.add_item_to_state(name, item.clone(), false);
        }
    }

    fn item_updated(&self, name: &str, item: &Item, _previous: Option<&Item>) {
        self.parent.update_item_in_state(name, item.clone());
    }

    fn item_deleted(&self, name: &str, item: &Item) {
        self.parent.remove_item_from_state(name, item.clone());
    }

    fn state_changed(&self, name: &str, value: &StateValue) {
        self.parent.set_state_by_name(name, value.clone(), true);
    }
}
