//! Asynchronous state manager: fetch de-duplication and run bookkeeping.
//!
//! An asynchronous backend resolves reads out of band: the manager starts a
//! primitive fetch and the backend calls back into the run handle when the
//! values arrive. Between those two points any further read for the same
//! name returns an empty value instead of issuing a duplicate fetch.

use crate::equality::EqualityRegistry;
use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeDelegate, ChangeListener, StateEvent};
use crate::filter::{Filter, FilterEngine};
use crate::manager::StateManager;
use crate::types::{CollectionSpec, Item, StateValue};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Per-name run bookkeeping.
#[derive(Debug, Default)]
struct Run {
    completed: bool,
    in_progress: bool,
    generation: u64,
    value: StateValue,
}

struct AsyncShared {
    runs: RwLock<HashMap<String, Run>>,
    delegate: Arc<ChangeDelegate>,
}

/// Completion handle for one fetch cycle.
///
/// The handle carries the generation the fetch was started under; a
/// completion whose generation no longer matches the current run (because a
/// force-reset happened in between) is discarded, so a slow in-flight fetch
/// can never overwrite fresher state.
pub struct RunHandle {
    name: String,
    generation: u64,
    shared: Arc<AsyncShared>,
}

impl RunHandle {
    /// Returns the state name this run fetches.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers the fetched values, completing the run.
    ///
    /// Sets `completed` and clears `in_progress` atomically, then informs
    /// listeners with a `StateChanged` event. Stale completions are dropped.
    pub fn complete(self, items: Vec<Item>) {
        let value = StateValue::Many(items);
        {
            let mut runs = self.shared.runs.write();
            let Some(run) = runs.get_mut(&self.name) else {
                return;
            };
            if run.generation != self.generation {
                tracing::debug!(
                    state = %self.name,
                    started_under = self.generation,
                    current = run.generation,
                    "discarding stale fetch completion"
                );
                return;
            }
            run.completed = true;
            run.in_progress = false;
            run.value = value.clone();
        }
        self.shared
            .delegate
            .inform(&self.name, StateEvent::StateChanged { value: &value });
    }

    /// Marks the run failed, clearing `in_progress` so a later read retries.
    pub fn fail(self, error: &CoreError) {
        tracing::warn!(state = %self.name, error = %error, "fetch failed");
        let mut runs = self.shared.runs.write();
        if let Some(run) = runs.get_mut(&self.name) {
            if run.generation == self.generation {
                run.in_progress = false;
            }
        }
    }
}

/// The primitives an asynchronous backend provides.
///
/// `start_fetch` is expected to call [`RunHandle::complete`] (or
/// [`RunHandle::fail`]) out of band; the write primitives persist one item
/// to the backing medium.
pub trait AsyncFetcher: Send + Sync {
    /// Starts one fetch cycle for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch cannot even be started; in-flight
    /// failures go through [`RunHandle::fail`] instead.
    fn start_fetch(&self, name: &str, run: RunHandle) -> CoreResult<()>;

    /// Persists a new item.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be issued.
    fn create(&self, name: &str, item: &Item) -> CoreResult<()>;

    /// Persists a replacement for an existing item.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be issued.
    fn update(&self, name: &str, item: &Item) -> CoreResult<()>;

    /// Deletes an item from the backing medium.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be issued.
    fn destroy(&self, name: &str, item: &Item) -> CoreResult<()>;
}

/// Asynchronous state manager over a pluggable [`AsyncFetcher`].
pub struct AsyncManager {
    fetcher: Arc<dyn AsyncFetcher>,
    shared: Arc<AsyncShared>,
    equality: Arc<EqualityRegistry>,
    engine: FilterEngine,
    names: HashSet<String>,
}

impl AsyncManager {
    /// Creates a manager over the given fetcher for the configured collections.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn AsyncFetcher>,
        delegate: Arc<ChangeDelegate>,
        equality: Arc<EqualityRegistry>,
        specs: &[CollectionSpec],
    ) -> Self {
        Self {
            fetcher,
            shared: Arc::new(AsyncShared {
                runs: RwLock::new(HashMap::new()),
                delegate,
            }),
            equality,
            engine: FilterEngine::default(),
            names: specs.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Returns the delegate this manager emits through.
    #[must_use]
    pub fn delegate(&self) -> &Arc<ChangeDelegate> {
        &self.shared.delegate
    }

    /// Returns true once a run has completed for `name`.
    #[must_use]
    pub fn run_completed(&self, name: &str) -> bool {
        self.shared
            .runs
            .read()
            .get(name)
            .is_some_and(|run| run.completed)
    }

    /// Returns true while a fetch is in flight for `name`.
    #[must_use]
    pub fn run_in_progress(&self, name: &str) -> bool {
        self.shared
            .runs
            .read()
            .get(name)
            .is_some_and(|run| run.in_progress)
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

    fn buffered(&self, name: &str) -> StateValue {
        self.shared
            .runs
            .read()
            .get(name)
            .map(|run| run.value.clone())
            .unwrap_or(StateValue::Unset)
    }

    fn mutate_buffer<F>(&self, name: &str, mutate: F)
    where
        F: FnOnce(&mut Vec<Item>),
    {
        let mut runs = self.shared.runs.write();
        let run = runs.entry(name.to_string()).or_default();
        let mut items = run.value.to_items();
        mutate(&mut items);
        run.value = StateValue::Many(items);
    }
}

impl StateManager for AsyncManager {
    fn state_by_name(&self, name: &str) -> StateValue {
        if !self.is_configured(name) {
            return StateValue::Unset;
        }

        let generation = {
            let mut runs = self.shared.runs.write();
            let run = runs.entry(name.to_string()).or_default();
            if run.in_progress {
                // Fetch de-duplication: one primitive fetch per run.
                return StateValue::Unset;
            }
            if run.completed {
                return run.value.clone();
            }
            run.in_progress = true;
            run.generation
        };

        let handle = RunHandle {
            name: name.to_string(),
            generation,
            shared: Arc::clone(&self.shared),
        };
        if let Err(e) = self.fetcher.start_fetch(name, handle) {
            tracing::warn!(state = name, error = %e, "fetch could not be started");
            let mut runs = self.shared.runs.write();
            if let Some(run) = runs.get_mut(name) {
                run.in_progress = false;
            }
        }
        StateValue::Unset
    }

    fn set_state_by_name(&self, name: &str, value: StateValue, inform: bool) {
        if !self.is_configured(name) {
            return;
        }
        {
            let mut runs = self.shared.runs.write();
            let run = runs.entry(name.to_string()).or_default();
            run.value = value.clone();
            run.completed = true;
            run.in_progress = false;
        }
        if inform {
            self.shared
                .delegate
                .inform(name, StateEvent::StateChanged { value: &value });
        }
    }

    fn add_item_to_state(&self, name: &str, item: Item, is_persisted: bool) {
        if !self.is_configured(name) {
            return;
        }
        self.mutate_buffer(name, |items| items.push(item.clone()));
        if !is_persisted {
            if let Err(e) = self.fetcher.create(name, &item) {
                tracing::warn!(state = name, error = %e, "create failed");
            }
        }
        self.shared.delegate.inform(
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
        let equals = self.equality.for_name(name);
        let previous = self
            .buffered(name)
            .to_items()
            .into_iter()
            .find(|existing| equals(existing, &item));
        self.mutate_buffer(name, |items| {
            if let Some(position) = items.iter().position(|existing| equals(existing, &item)) {
                items[position] = item.clone();
            }
        });
        if let Err(e) = self.fetcher.update(name, &item) {
            tracing::warn!(state = name, error = %e, "update failed");
        }
        self.shared.delegate.inform(
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
        let equals = self.equality.for_name(name);
        let removed = self
            .buffered(name)
            .to_items()
            .into_iter()
            .find(|existing| equals(existing, &item));
        self.mutate_buffer(name, |items| {
            if let Some(position) = items.iter().position(|existing| equals(existing, &item)) {
                items.remove(position);
            }
        });
        if let Err(e) = self.fetcher.destroy(name, &item) {
            tracing::warn!(state = name, error = %e, "destroy failed");
        }
        let deleted = removed.unwrap_or(item);
        self.shared
            .delegate
            .inform(name, StateEvent::ItemDeleted { item: &deleted });
    }

    fn find_item_in_state(&self, name: &str, item: &Item) -> Option<Item> {
        if !self.is_configured(name) {
            return Some(item.clone());
        }
        let equals = self.equality.for_name(name);
        let found = self
            .state_by_name(name)
            .to_items()
            .into_iter()
            .find(|existing| equals(existing, item));
        self.shared.delegate.inform(
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
        let results = self
            .engine
            .apply(&self.state_by_name(name).to_items(), filters);
        self.shared
            .delegate
            .inform(name, StateEvent::FilterResults { items: &results });
        results
    }

    fn add_change_listener(&self, name: &str, listener: Arc<dyn ChangeListener>) {
        // Late-subscriber catch-up: a completed run replays its last known
        // value to the new listener without a new fetch.
        let replay = {
            let runs = self.shared.runs.read();
            runs.get(name)
                .filter(|run| run.completed)
                .map(|run| run.value.clone())
        };
        if let Some(value) = replay {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.state_changed(name, &value)));
            if outcome.is_err() {
                tracing::warn!(state = name, "listener panicked during catch-up replay");
            }
        }
        self.shared.delegate.add_listener(name, listener);
    }

    fn force_reset_for_get(&self, name: &str) {
        let mut runs = self.shared.runs.write();
        let run = runs.entry(name.to_string()).or_default();
        run.completed = false;
        run.in_progress = false;
        run.generation += 1;
    }

    fn is_async(&self) -> bool {
        true
    }
}
