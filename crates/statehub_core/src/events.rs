//! Change notification delegate.
//!
//! The delegate keeps a per-state-name listener registry and dispatches
//! typed events after each state mutation. Delivery is fire-and-forget:
//! there is no return value, listeners are invoked in registration order,
//! and a panicking listener never blocks delivery to the remaining
//! listeners for that name.

use crate::types::{Item, StateValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The kinds of change events a manager can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEventType {
    /// An item was added to a named state.
    ItemAdded,
    /// An item in a named state was replaced.
    ItemUpdated,
    /// An item was removed from a named state.
    ItemDeleted,
    /// A named state was replaced wholesale.
    StateChanged,
    /// A filtered query produced results.
    FilterResults,
    /// An identity lookup produced a result.
    FindItem,
    /// A conditional fetch found the item unchanged on the server.
    ItemNotModified,
}

/// One typed change event, borrowed from the emitting manager.
///
/// A previous value is only meaningful for `ItemUpdated`.
#[derive(Debug, Clone, Copy)]
pub enum StateEvent<'a> {
    /// An item was added. `persisted` is true when the item arrived from a
    /// backing store rather than a fresh user action.
    ItemAdded {
        /// The added item.
        item: &'a Item,
        /// Whether the item came from persistence.
        persisted: bool,
    },
    /// An item was replaced.
    ItemUpdated {
        /// The new item.
        item: &'a Item,
        /// The value it replaced, when known.
        previous: Option<&'a Item>,
    },
    /// An item was removed.
    ItemDeleted {
        /// The removed item.
        item: &'a Item,
    },
    /// The whole named state was replaced.
    StateChanged {
        /// The new value.
        value: &'a StateValue,
    },
    /// A filtered query completed.
    FilterResults {
        /// The matching items.
        items: &'a [Item],
    },
    /// An identity lookup completed.
    FindItem {
        /// The found item, if any.
        item: Option<&'a Item>,
    },
    /// The server reported an item unchanged.
    ItemNotModified {
        /// The item that was checked.
        item: &'a Item,
    },
}

impl StateEvent<'_> {
    /// Returns the event's type tag.
    #[must_use]
    pub fn event_type(&self) -> StateEventType {
        match self {
            StateEvent::ItemAdded { .. } => StateEventType::ItemAdded,
            StateEvent::ItemUpdated { .. } => StateEventType::ItemUpdated,
            StateEvent::ItemDeleted { .. } => StateEventType::ItemDeleted,
            StateEvent::StateChanged { .. } => StateEventType::StateChanged,
            StateEvent::FilterResults { .. } => StateEventType::FilterResults,
            StateEvent::FindItem { .. } => StateEventType::FindItem,
            StateEvent::ItemNotModified { .. } => StateEventType::ItemNotModified,
        }
    }
}

/// A subscriber to change events for one or more state names.
///
/// Every method has a no-op default so listeners implement only the event
/// kinds they care about.
#[allow(unused_variables)]
pub trait ChangeListener: Send + Sync {
    /// An item was added to `name`.
    fn item_added(&self, name: &str, item: &Item, persisted: bool) {}

    /// An item in `name` was replaced.
    fn item_updated(&self, name: &str, item: &Item, previous: Option<&Item>) {}

    /// An item was removed from `name`.
    fn item_deleted(&self, name: &str, item: &Item) {}

    /// The whole state for `name` was replaced.
    fn state_changed(&self, name: &str, value: &StateValue) {}

    /// A filtered query over `name` completed.
    fn filter_results(&self, name: &str, items: &[Item]) {}

    /// An identity lookup in `name` completed.
    fn find_item(&self, name: &str, item: Option<&Item>) {}

    /// The server reported an item of `name` unchanged.
    fn item_not_modified(&self, name: &str, item: &Item) {}
}

/// Per-state-name listener registry with typed dispatch.
///
/// Registration order is delivery order. Listeners are never removed; the
/// registry only grows.
pub struct ChangeDelegate {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn ChangeListener>>>>,
    suppressed: AtomicBool,
}

impl ChangeDelegate {
    /// Creates an empty delegate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            suppressed: AtomicBool::new(false),
        }
    }

    /// Registers a listener for a state name.
    pub fn add_listener(&self, name: &str, listener: Arc<dyn ChangeListener>) {
        self.listeners
            .write()
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }

    /// Returns the number of listeners registered for a name.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }

    /// Globally suppresses event delivery.
    ///
    /// Used during bulk operations to avoid redundant notifications.
    pub fn suppress_events(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    /// Re-enables event delivery after [`Self::suppress_events`].
    pub fn emit_events(&self) {
        self.suppressed.store(false, Ordering::SeqCst);
    }

    /// Returns true while delivery is suppressed.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Delivers an event to every listener registered for `name`.
    ///
    /// A panic in one listener is caught and logged; delivery continues to
    /// the remaining listeners.
    pub fn inform(&self, name: &str, event: StateEvent<'_>) {
        if self.is_suppressed() {
            return;
        }

        let targets = match self.listeners.read().get(name) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                StateEvent::ItemAdded { item, persisted } => {
                    listener.item_added(name, item, persisted);
                }
                StateEvent::ItemUpdated { item, previous } => {
                    listener.item_updated(name, item, previous);
                }
                StateEvent::ItemDeleted { item } => listener.item_deleted(name, item),
                StateEvent::StateChanged { value } => listener.state_changed(name, value),
                StateEvent::FilterResults { items } => listener.filter_results(name, items),
                StateEvent::FindItem { item } => listener.find_item(name, item),
                StateEvent::ItemNotModified { item } => listener.item_not_modified(name, item),
            }));

            if outcome.is_err() {
                tracing::warn!(
                    state = name,
                    event = ?event.event_type(),
                    "listener panicked during delivery, continuing with remaining listeners"
                );
            }
        }
    }
}

impl Default for ChangeDelegate {
    fn default() -> Self {
        Self::new()
    }
}
