//! End-to-end wiring: REST-backed manager, request queue, offline manager
//! and persistent cache working together.

use parking_lot::Mutex;
use serde_json::json;
use statehub_core::{
    AsyncManager, ChangeDelegate, ChangeListener, CollectionSpec, EqualityRegistry, Item,
    StateManager, StateValue,
};
use statehub_remote::{
    cache_meta_spec, offline_collection_spec, ApiFeatures, CacheEntryConfig, ManualClock, Method,
    MockTransport, OfflineConfig, OfflineManager, PersistentCache, RequestQueue, RestAdapter,
    StaticAuth, StaticContext,
};
use statehub_store::LocalStore;
use std::collections::HashMap;
use std::sync::Arc;

fn item(v: serde_json::Value) -> Item {
    Item::from_value(v).unwrap()
}

struct Stack {
    transport: Arc<MockTransport>,
    auth: Arc<StaticAuth>,
    queue: Arc<RequestQueue>,
    manager: Arc<AsyncManager>,
    offline: Arc<OfflineManager>,
    store: Arc<LocalStore>,
    clock: Arc<ManualClock>,
}

fn stack(dir: &std::path::Path) -> Stack {
    let transport = Arc::new(MockTransport::new());
    let auth = Arc::new(StaticAuth::requiring_token());
    auth.sign_in("alice", "tok");

    let queue = Arc::new(RequestQueue::new(transport.clone(), auth.clone()));
    let specs = vec![CollectionSpec::keyed_by_id("tasks")];
    let adapter = Arc::new(
        RestAdapter::new(
            "http://api.example",
            queue.clone(),
            Arc::new(StaticContext::empty()),
        )
        .with_collection("tasks", "tasks", "id", ApiFeatures::all()),
    );
    let manager = Arc::new(AsyncManager::new(
        adapter,
        Arc::new(ChangeDelegate::new()),
        Arc::new(EqualityRegistry::from_specs(&specs)),
        &specs,
    ));

    let store = Arc::new(
        LocalStore::open(
            dir,
            &[
                CollectionSpec::keyed_by_id("tasks"),
                offline_collection_spec(),
                cache_meta_spec(),
            ],
            1,
        )
        .unwrap(),
    );
    let offline = Arc::new(OfflineManager::new(
        OfflineConfig::new("http://api.example/ping").with_poll_interval(10),
        transport.clone(),
        store.clone(),
        queue.clone(),
    ));
    queue.set_offline_handler(offline.clone());

    Stack {
        transport,
        auth,
        queue,
        manager,
        offline,
        store,
        clock: Arc::new(ManualClock::starting_at(50_000)),
    }
}

#[test]
fn writes_survive_an_outage_and_replay_with_priority() {
    let dir = tempfile::tempdir().unwrap();
    let s = stack(dir.path());

    // A healthy create goes straight through.
    s.transport.respond_with(201, json!({}));
    s.manager
        .add_item_to_state("tasks", item(json!({"id": 1, "title": "before"})), false);
    assert_eq!(s.transport.call_count(), 1);

    // The server dies; the next two writes queue durably instead.
    s.transport.fail_with("connection refused");
    s.manager
        .add_item_to_state("tasks", item(json!({"id": 2, "title": "queued"})), false);
    s.manager
        .update_item_in_state("tasks", item(json!({"id": 1, "title": "edited"})));

    assert!(s.offline.is_offline());
    assert_eq!(s.offline.queued_write_count(), 2);
    // The second write bypassed the transport entirely.
    assert_eq!(s.transport.call_count(), 2);

    // Reconnect: ping succeeds, both replays succeed.
    s.transport.respond_with(200, json!({}));
    s.transport.respond_with(201, json!({}));
    s.transport.respond_with(200, json!({}));
    s.offline.poll(s.clock.as_ref());

    assert!(!s.offline.is_offline());
    assert_eq!(s.offline.queued_write_count(), 0);

    let replayed: Vec<Method> = s.transport.calls()[3..].iter().map(|r| r.method).collect();
    assert!(replayed.contains(&Method::Post));
    assert!(replayed.contains(&Method::Put));
}

#[test]
fn auth_gate_holds_fetches_until_sign_in() {
    let dir = tempfile::tempdir().unwrap();
    let s = stack(dir.path());
    s.auth.sign_out();

    assert_eq!(s.manager.state_by_name("tasks"), StateValue::Unset);
    assert_eq!(s.transport.call_count(), 0);
    assert_eq!(s.queue.priority_len(), 1);

    s.transport.respond_with(200, json!([{"id": 7}]));
    s.auth.sign_in("alice", "tok");
    s.queue.token_became_available();

    assert_eq!(s.manager.state_by_name("tasks").to_items().len(), 1);
}

#[test]
fn cache_serves_locally_within_ttl_and_refreshes_after() {
    let dir = tempfile::tempdir().unwrap();
    let s = stack(dir.path());

    let cache = Arc::new(PersistentCache::new(
        s.store.clone(),
        s.manager.clone(),
        s.clock.clone(),
    ));
    cache.add_collection_to_cache_configuration(CacheEntryConfig::new("tasks", "id", 3_600));
    cache.subscribe_all();
    cache.initialise_after_collections_added(&HashMap::new());

    // First load fetches remotely and lands in the cache.
    s.transport.respond_with(200, json!([{"id": 1, "title": "remote"}]));
    cache.load("tasks");
    let cached = cache.load("tasks");
    assert_eq!(cached.len(), 1);
    assert_eq!(cache.last_refreshed("tasks"), Some(50_000));
    let calls_after_load = s.transport.call_count();

    // Within the TTL the next session serves the cache without traffic.
    s.clock.advance(60);
    cache.initialise_after_collections_added(&HashMap::new());
    // Still marked fresh: no force reset, but first in-session load does
    // consult the (already completed) manager buffer.
    let served = cache.load("tasks");
    assert_eq!(served.len(), 1);
    assert_eq!(s.transport.call_count(), calls_after_load);

    // Past the TTL a refresh goes out again.
    s.clock.advance(3_601);
    cache.initialise_after_collections_added(&HashMap::new());
    s.transport.respond_with(200, json!([{"id": 1, "title": "newer"}]));
    cache.load("tasks");
    let refreshed = cache.load("tasks");
    assert_eq!(refreshed[0].get("title"), Some(&json!("newer")));
}

#[test]
fn listeners_observe_a_remote_fetch_completing() {
    struct Capture {
        values: Mutex<Vec<usize>>,
    }
    impl ChangeListener for Capture {
        fn state_changed(&self, _name: &str, value: &StateValue) {
            self.values.lock().push(value.to_items().len());
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let s = stack(dir.path());
    let capture = Arc::new(Capture {
        values: Mutex::new(Vec::new()),
    });
    s.manager.add_change_listener("tasks", capture.clone());

    s.transport.respond_with(200, json!([{"id": 1}, {"id": 2}]));
    s.manager.state_by_name("tasks");

    assert_eq!(*capture.values.lock(), vec![2]);
}
