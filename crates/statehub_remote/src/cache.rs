//! TTL-based persistent cache over a remote state manager.
//!
//! Each cached collection carries a refresh interval and a persisted
//! `last_refreshed` timestamp. At session start
//! [`PersistentCache::initialise_after_collections_added`] decides per
//! collection whether the local copy is still trustworthy; a load then
//! either serves the local store or forces the remote source to re-fetch.
//! A successful remote load writes the cache first and advances the
//! bookkeeping second, so a crash between the two costs only one extra
//! refresh. Pushed changes from other users are applied immediately,
//! independent of the TTL.

use crate::clock::Clock;
use parking_lot::RwLock;
use statehub_core::{ChangeListener, CollectionSpec, Item, StateManager, StateValue};
use statehub_store::RecordStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the store collection holding refresh bookkeeping.
pub const CACHE_META_COLLECTION: &str = "statehub_cache_meta";

/// Returns the collection spec the backing store must be opened with.
#[must_use]
pub fn cache_meta_spec() -> CollectionSpec {
    CollectionSpec::new(CACHE_META_COLLECTION, "name")
}

/// Cache policy for one collection.
#[derive(Debug, Clone)]
pub struct CacheEntryConfig {
    /// The collection's state name.
    pub name: String,
    /// The field items are keyed by.
    pub key_field: String,
    /// Seconds before a cached copy goes stale.
    pub refresh_interval_secs: u64,
    last_refreshed: Option<u64>,
    should_refresh: bool,
    loaded: bool,
}

impl CacheEntryConfig {
    /// Creates a policy for `name` with the given TTL.
    pub fn new(
        name: impl Into<String>,
        key_field: impl Into<String>,
        refresh_interval_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            refresh_interval_secs,
            last_refreshed: None,
            should_refresh: false,
            loaded: false,
        }
    }
}

/// A change pushed from another user's session.
#[derive(Debug, Clone)]
pub enum PushChange {
    /// An item was created elsewhere.
    Created(Item),
    /// An item was updated elsewhere.
    Updated(Item),
    /// An item was deleted elsewhere.
    Deleted(Item),
}

/// Local persistent cache fed by a remote state manager.
///
/// Register it as a change listener on the remote manager (see
/// [`PersistentCache::subscribe_all`]) so completed remote loads land in
/// the cache.
pub struct PersistentCache {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn StateManager>,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntryConfig>>,
}

impl PersistentCache {
    /// Creates an empty cache.
    ///
    /// The store must have been opened with [`cache_meta_spec`] and one
    /// spec per cached collection.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn StateManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a collection to the cache configuration.
    ///
    /// Any persisted `last_refreshed` bookkeeping for the collection is
    /// loaded back.
    pub fn add_collection_to_cache_configuration(&self, mut config: CacheEntryConfig) {
        match self.store.get(CACHE_META_COLLECTION, &config.name) {
            Ok(Some(meta)) => {
                config.last_refreshed = meta.get("last_refreshed").and_then(|v| v.as_u64());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(state = %config.name, error = %e, "cannot read cache bookkeeping");
            }
        }
        self.entries.write().insert(config.name.clone(), config);
    }

    /// Marks each configured collection for refresh where warranted.
    ///
    /// Call once per session after all collections are added. A collection
    /// refreshes when it was never refreshed, its TTL expired, or the
    /// server reports data newer than the last refresh. Marking an entry
    /// stale also clears its in-session loaded flag.
    pub fn initialise_after_collections_added(&self, server_last_modified: &HashMap<String, u64>) {
        let now = self.clock.now_epoch_secs();
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            let stale = match entry.last_refreshed {
                None => true,
                Some(last) => {
                    last.saturating_add(entry.refresh_interval_secs) < now
                        || server_last_modified
                            .get(&entry.name)
                            .is_some_and(|server| *server > last)
                }
            };
            entry.should_refresh = stale;
            if stale {
                entry.loaded = false;
                tracing::debug!(state = %entry.name, "cache entry marked for refresh");
            }
        }
    }

    /// Subscribes the cache to every configured collection on the remote
    /// manager.
    pub fn subscribe_all(self: &Arc<Self>) {
        let names: Vec<String> = self.entries.read().keys().cloned().collect();
        for name in names {
            self.remote
                .add_change_listener(&name, Arc::clone(self) as Arc<dyn ChangeListener>);
        }
    }

    /// Loads a collection, refreshing from the remote source if the entry
    /// is marked stale or was not yet loaded this session.
    ///
    /// Returns the local cache contents; with an out-of-band remote the
    /// refreshed values arrive through the listener once the fetch
    /// completes.
    pub fn load(&self, name: &str) -> Vec<Item> {
        let needs_remote = {
            let entries = self.entries.read();
            match entries.get(name) {
                Some(entry) => entry.should_refresh || !entry.loaded,
                None => {
                    tracing::warn!(state = name, "load for uncached collection");
                    return Vec::new();
                }
            }
        };

        if needs_remote {
            self.remote.force_reset_for_get(name);
            // The completed fetch lands in the cache via state_changed.
            let _ = self.remote.state_by_name(name);
        }

        match self.store.get_all(name) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(state = name, error = %e, "cache read failed");
                Vec::new()
            }
        }
    }

    /// Applies a change pushed from another user, bypassing the TTL.
    pub fn apply_push(&self, name: &str, change: PushChange) {
        let key_field = match self.entries.read().get(name) {
            Some(entry) => entry.key_field.clone(),
            None => {
                tracing::warn!(state = name, "push for uncached collection");
                return;
            }
        };

        let result = match &change {
            PushChange::Created(item) | PushChange::Updated(item) => self.store.put(name, item),
            PushChange::Deleted(item) => match item.key_string(name, &key_field) {
                Ok(key) => self.store.delete(name, &key),
                Err(e) => {
                    tracing::warn!(state = name, error = %e, "pushed delete has no key");
                    return;
                }
            },
        };
        if let Err(e) = result {
            tracing::warn!(state = name, error = %e, "failed to apply pushed change");
            return;
        }
        self.record_refresh(name);
    }

    /// Returns the persisted last-refresh time for a collection.
    #[must_use]
    pub fn last_refreshed(&self, name: &str) -> Option<u64> {
        self.entries.read().get(name).and_then(|e| e.last_refreshed)
    }

    fn is_cached(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    fn record_refresh(&self, name: &str) {
        let now = self.clock.now_epoch_secs();
        {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get_mut(name) {
                entry.last_refreshed = Some(now);
                entry.should_refresh = false;
                entry.loaded = true;
            }
        }
        let meta = Item::from_value(serde_json::json!({
            "name": name,
            "last_refreshed": now,
        }));
        match meta {
            Ok(meta) => {
                if let Err(e) = self.store.put(CACHE_META_COLLECTION, &meta) {
                    tracing::warn!(state = name, error = %e, "failed to persist cache bookkeeping");
                }
            }
            Err(e) => tracing::warn!(state = name, error = %e, "failed to encode cache bookkeeping"),
        }
    }
}

impl ChangeListener for PersistentCache {
    fn state_changed(&self, name: &str, value: &StateValue) {
        if !self.is_cached(name) {
            return;
        }
        // Cache first, bookkeeping second.
        if let Err(e) = self.store.put_all(name, &value.to_items()) {
            tracing::warn!(state = name, error = %e, "failed to write cache");
            return;
        }
        self.record_refresh(name);
    }

    fn item_added(&self, name: &str, item: &Item, _persisted: bool) {
        if !self.is_cached(name) {
            return;
        }
        if let Err(e) = self.store.put(name, item) {
            tracing::warn!(state = name, error = %e, "failed to cache added item");
        }
    }

    fn item_updated(&self, name: &str, item: &Item, _previous: Option<&Item>) {
        if !self.is_cached(name) {
            return;
        }
        if let Err(e) = self.store.put(name, item) {
            tracing::warn!(state = name, error = %e, "failed to cache updated item");
        }
    }

    fn item_deleted(&self, name: &str, item: &Item) {
        let key_field = match self.entries.read().get(name) {
            Some(entry) => entry.key_field.clone(),
            None => return,
        };
        match item.key_string(name, &key_field) {
            Ok(key) => {
                if let Err(e) = self.store.delete(name, &key) {
                    tracing::warn!(state = name, error = %e, "failed to evict deleted item");
                }
            }
            Err(e) => tracing::warn!(state = name, error = %e, "deleted item has no key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use serde_json::json;
    use statehub_core::{ChangeDelegate, Filter, StateEvent};
    use statehub_store::LocalStore;

    fn item(v: serde_json::Value) -> Item {
        Item::from_value(v).unwrap()
    }

    /// Remote stand-in that answers fetches synchronously through its
    /// delegate, the way a completed run would.
    struct SpyRemote {
        delegate: Arc<ChangeDelegate>,
        value: Mutex<StateValue>,
        force_resets: Mutex<Vec<String>>,
        fetches: Mutex<Vec<String>>,
    }

    impl SpyRemote {
        fn new(value: StateValue) -> Arc<Self> {
            Arc::new(Self {
                delegate: Arc::new(ChangeDelegate::new()),
                value: Mutex::new(value),
                force_resets: Mutex::new(Vec::new()),
                fetches: Mutex::new(Vec::new()),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().len()
        }
    }

    impl StateManager for SpyRemote {
        fn state_by_name(&self, name: &str) -> StateValue {
            self.fetches.lock().push(name.to_string());
            let value = self.value.lock().clone();
            self.delegate
                .inform(name, StateEvent::StateChanged { value: &value });
            value
        }

        fn set_state_by_name(&self, _name: &str, value: StateValue, _inform: bool) {
            *self.value.lock() = value;
        }

        fn add_item_to_state(&self, _name: &str, _item: Item, _is_persisted: bool) {}
        fn update_item_in_state(&self, _name: &str, _item: Item) {}
        fn remove_item_from_state(&self, _name: &str, _item: Item) {}

        fn find_item_in_state(&self, _name: &str, item: &Item) -> Option<Item> {
            Some(item.clone())
        }

        fn find_items_in_state(&self, _name: &str, _filters: &[Filter]) -> Vec<Item> {
            Vec::new()
        }

        fn add_change_listener(&self, name: &str, listener: Arc<dyn ChangeListener>) {
            self.delegate.add_listener(name, listener);
        }

        fn force_reset_for_get(&self, name: &str) {
            self.force_resets.lock().push(name.to_string());
        }

        fn is_async(&self) -> bool {
            true
        }
    }

    struct Fixture {
        store: Arc<LocalStore>,
        remote: Arc<SpyRemote>,
        cache: Arc<PersistentCache>,
        clock: Arc<ManualClock>,
    }

    fn fixture(dir: &std::path::Path, remote_value: StateValue) -> Fixture {
        let specs = vec![CollectionSpec::keyed_by_id("tasks"), cache_meta_spec()];
        let store = Arc::new(LocalStore::open(dir, &specs, 1).unwrap());
        let remote = SpyRemote::new(remote_value);
        let clock = Arc::new(ManualClock::starting_at(10_000));
        let cache = Arc::new(PersistentCache::new(
            store.clone(),
            remote.clone(),
            clock.clone(),
        ));
        cache.add_collection_to_cache_configuration(CacheEntryConfig::new("tasks", "id", 3_600));
        cache.subscribe_all();
        Fixture {
            store,
            remote,
            cache,
            clock,
        }
    }

    #[test]
    fn first_ever_load_refreshes_from_remote() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1, "title": "remote"}))]),
        );

        f.cache.initialise_after_collections_added(&HashMap::new());
        let items = f.cache.load("tasks");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get("title"), Some(&json!("remote")));
        assert_eq!(*f.remote.force_resets.lock(), vec!["tasks"]);
        // Bookkeeping advanced after the cache write.
        assert_eq!(f.cache.last_refreshed("tasks"), Some(10_000));
    }

    #[test]
    fn fresh_entry_is_served_locally() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1}))]),
        );

        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");
        let fetches_after_first = f.remote.fetch_count();

        // Second load in the same session touches only the local store.
        let items = f.cache.load("tasks");
        assert_eq!(items.len(), 1);
        assert_eq!(f.remote.fetch_count(), fetches_after_first);
    }

    #[test]
    fn expired_ttl_marks_the_entry_for_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1}))]),
        );

        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");

        // Next session, past the TTL.
        f.clock.advance(3_601);
        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");
        assert_eq!(f.remote.force_resets.lock().len(), 2);
    }

    #[test]
    fn newer_server_data_beats_an_unexpired_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1}))]),
        );

        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");

        // Well within the TTL, but the server has newer data.
        f.clock.advance(60);
        let server = HashMap::from([("tasks".to_string(), 10_030_u64)]);
        f.cache.initialise_after_collections_added(&server);
        f.cache.load("tasks");
        assert_eq!(f.remote.force_resets.lock().len(), 2);
    }

    #[test]
    fn bookkeeping_survives_a_new_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1}))]),
        );
        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");

        // A new session over the same store reads the bookkeeping back and
        // finds the entry still fresh.
        let rebuilt = Arc::new(PersistentCache::new(
            f.store.clone(),
            f.remote.clone(),
            f.clock.clone(),
        ));
        rebuilt.add_collection_to_cache_configuration(CacheEntryConfig::new("tasks", "id", 3_600));
        assert_eq!(rebuilt.last_refreshed("tasks"), Some(10_000));

        rebuilt.initialise_after_collections_added(&HashMap::new());
        rebuilt.subscribe_all();
        let before = f.remote.force_resets.lock().len();
        rebuilt.load("tasks");
        // Not loaded this session yet, so one remote load happens, but the
        // entry was not marked stale by initialise.
        assert_eq!(f.remote.force_resets.lock().len(), before + 1);
    }

    #[test]
    fn pushed_changes_apply_immediately_regardless_of_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            StateValue::Many(vec![item(json!({"id": 1, "title": "a"}))]),
        );
        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");

        f.clock.advance(10);
        f.cache
            .apply_push("tasks", PushChange::Created(item(json!({"id": 2, "title": "pushed"}))));
        f.cache
            .apply_push("tasks", PushChange::Deleted(item(json!({"id": 1}))));

        let cached = f.store.get_all("tasks").unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].get("id"), Some(&json!(2)));
        // Bookkeeping advanced with the push.
        assert_eq!(f.cache.last_refreshed("tasks"), Some(10_010));
    }

    #[test]
    fn item_events_keep_the_cache_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), StateValue::Many(vec![]));
        f.cache.initialise_after_collections_added(&HashMap::new());
        f.cache.load("tasks");

        let added = item(json!({"id": 3, "title": "local add"}));
        f.remote.delegate.inform(
            "tasks",
            StateEvent::ItemAdded {
                item: &added,
                persisted: false,
            },
        );
        assert_eq!(f.store.get_all("tasks").unwrap().len(), 1);

        f.remote
            .delegate
            .inform("tasks", StateEvent::ItemDeleted { item: &added });
        assert!(f.store.get_all("tasks").unwrap().is_empty());
    }
}
