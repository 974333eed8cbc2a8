//! Offline detection and durable replay.
//!
//! The first unreachable response flips the manager offline. While offline,
//! write-class requests are persisted as envelopes in a dedicated store
//! collection and read-class requests are rejected immediately. Liveness is
//! probed by pinging a configured URL at a fixed interval; the first
//! successful ping flips the manager back online and replays every envelope
//! through the queue with priority, deleting each one as its replay
//! completes. Replay is at-least-once: an envelope that fails again is
//! simply kept for the next offline cycle.

use crate::clock::Clock;
use crate::error::RemoteError;
use crate::queue::{QueueCallback, QueueOutcome, RequestQueue, UnreachableHandler};
use crate::transport::{HttpRequest, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use statehub_core::{CollectionSpec, Item};
use statehub_store::RecordStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the store collection holding queued offline writes.
pub const OFFLINE_COLLECTION: &str = "statehub_offline_queue";

/// Returns the collection spec the backing store must be opened with.
#[must_use]
pub fn offline_collection_spec() -> CollectionSpec {
    CollectionSpec::new(OFFLINE_COLLECTION, "id")
}

/// One queued write, persisted until its replay succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OfflineEnvelope {
    id: Uuid,
    request: HttpRequest,
}

/// Configuration for offline detection.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// URL pinged to probe liveness.
    pub ping_url: String,
    /// Seconds between pings while offline.
    pub poll_interval_secs: u64,
}

impl OfflineConfig {
    /// Creates a config pinging `ping_url` every 30 seconds.
    pub fn new(ping_url: impl Into<String>) -> Self {
        Self {
            ping_url: ping_url.into(),
            poll_interval_secs: 30,
        }
    }

    /// Sets the ping interval.
    #[must_use]
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }
}

/// Notified when connectivity changes.
#[allow(unused_variables)]
pub trait ConnectivityListener: Send + Sync {
    /// The server became unreachable.
    fn server_offline(&self) {}

    /// The server answered a ping after being offline.
    fn server_online(&self) {}

    /// Queued offline writes are about to be replayed.
    fn sending_queued_changes(&self) {}
}

/// Tracks server reachability and replays queued writes on reconnection.
pub struct OfflineManager {
    config: OfflineConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn RecordStore>,
    queue: Arc<RequestQueue>,
    offline: AtomicBool,
    last_ping: Mutex<Option<u64>>,
    listeners: RwLock<Vec<Arc<dyn ConnectivityListener>>>,
}

impl OfflineManager {
    /// Creates a manager.
    ///
    /// The store must have been opened with [`offline_collection_spec`]
    /// among its collections. Install the result on the queue with
    /// [`RequestQueue::set_offline_handler`].
    #[must_use]
    pub fn new(
        config: OfflineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
        queue: Arc<RequestQueue>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            queue,
            offline: AtomicBool::new(false),
            last_ping: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a connectivity listener.
    pub fn add_listener(&self, listener: Arc<dyn ConnectivityListener>) {
        self.listeners.write().push(listener);
    }

    /// Whether the server is currently considered unreachable.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of writes waiting for replay.
    #[must_use]
    pub fn queued_write_count(&self) -> usize {
        self.store
            .get_all(OFFLINE_COLLECTION)
            .map(|items| items.len())
            .unwrap_or(0)
    }

    /// Issues a liveness ping if the interval elapsed; on success goes back
    /// online and replays queued writes.
    ///
    /// Call from the application's periodic tick with `clock` time.
    pub fn poll(&self, clock: &dyn Clock) {
        if !self.offline.load(Ordering::SeqCst) {
            return;
        }
        let now = clock.now_epoch_secs();
        {
            let mut last = self.last_ping.lock();
            if last.is_some_and(|t| now < t.saturating_add(self.config.poll_interval_secs)) {
                return;
            }
            *last = Some(now);
        }

        match self.transport.call(&HttpRequest::get(&self.config.ping_url)) {
            Ok(response) if response.is_success() => self.back_online(),
            Ok(response) => {
                tracing::debug!(status = response.status, "ping answered with error status");
            }
            Err(error) => {
                tracing::debug!(error = %error, "ping failed, staying offline");
            }
        }
    }

    fn notify<F: Fn(&dyn ConnectivityListener)>(&self, f: F) {
        for listener in self.listeners.read().iter() {
            f(listener.as_ref());
        }
    }

    fn go_offline(&self) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            tracing::warn!("server unreachable, entering offline mode");
            *self.last_ping.lock() = None;
            self.notify(|l| l.server_offline());
        }
    }

    fn back_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
        tracing::info!("server reachable again");
        self.notify(|l| l.server_online());
        self.replay();
    }

    fn persist_write(&self, request: HttpRequest) {
        let envelope = OfflineEnvelope {
            id: Uuid::new_v4(),
            request,
        };
        let item = serde_json::to_value(&envelope)
            .map_err(|e| RemoteError::Serialization(e.to_string()))
            .and_then(|v| Item::from_value(v).map_err(RemoteError::from));
        match item {
            Ok(item) => {
                if let Err(e) = self.store.put(OFFLINE_COLLECTION, &item) {
                    tracing::warn!(error = %e, "failed to persist offline write");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode offline write"),
        }
    }

    fn replay(&self) {
        let envelopes = match self.store.get_all(OFFLINE_COLLECTION) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read offline queue");
                return;
            }
        };
        if envelopes.is_empty() {
            return;
        }

        self.notify(|l| l.sending_queued_changes());
        tracing::info!(count = envelopes.len(), "replaying queued offline writes");

        for item in envelopes {
            let envelope: OfflineEnvelope =
                match serde_json::from_value(item.clone().into_value()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable offline envelope");
                        continue;
                    }
                };

            let store = Arc::clone(&self.store);
            let id = envelope.id;
            let callback: QueueCallback = Arc::new(move |outcome| match outcome {
                QueueOutcome::Completed { .. } => {
                    if let Err(e) = store.delete(OFFLINE_COLLECTION, &id.to_string()) {
                        tracing::warn!(error = %e, "failed to delete replayed envelope");
                    }
                }
                QueueOutcome::Forbidden(_) | QueueOutcome::Failed(_) => {
                    tracing::warn!(envelope = %id, "offline replay did not complete");
                }
            });
            self.queue.enqueue_replay(envelope.request, callback);
        }
    }
}

impl UnreachableHandler for OfflineManager {
    fn is_offline(&self) -> bool {
        OfflineManager::is_offline(self)
    }

    fn server_unreachable(&self, request: HttpRequest, callback: QueueCallback, was_offline: bool) {
        self.go_offline();
        if was_offline {
            // The envelope for a failed replay is still persisted; it gets
            // another attempt on the next reconnection.
            return;
        }
        if request.method.is_write() {
            self.persist_write(request);
        } else {
            callback(QueueOutcome::Failed(RemoteError::OfflineReadRejected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::clock::ManualClock;
    use crate::transport::{Method, MockTransport};
    use serde_json::json;
    use statehub_store::LocalStore;

    struct Fixture {
        transport: Arc<MockTransport>,
        queue: Arc<RequestQueue>,
        manager: Arc<OfflineManager>,
        clock: ManualClock,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(RequestQueue::new(
            transport.clone(),
            Arc::new(StaticAuth::open()),
        ));
        let store = Arc::new(
            LocalStore::open(dir, &[offline_collection_spec()], 1).unwrap(),
        );
        let manager = Arc::new(OfflineManager::new(
            OfflineConfig::new("http://x/ping").with_poll_interval(10),
            transport.clone(),
            store,
            queue.clone(),
        ));
        queue.set_offline_handler(manager.clone());
        Fixture {
            transport,
            queue,
            manager,
            clock: ManualClock::starting_at(1_000),
        }
    }

    fn noop() -> QueueCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn first_failure_enters_offline_and_persists_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        f.transport.fail_with("connection refused");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );

        assert!(f.manager.is_offline());
        assert_eq!(f.manager.queued_write_count(), 1);
    }

    #[test]
    fn reads_are_rejected_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        f.transport.fail_with("connection refused");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );

        let outcome = Arc::new(Mutex::new(None));
        let captured = outcome.clone();
        f.queue.enqueue(
            HttpRequest::get("http://x/tasks"),
            crate::queue::QueueClass::Priority,
            Arc::new(move |o| *captured.lock() = Some(o)),
        );

        match outcome.lock().take() {
            Some(QueueOutcome::Failed(RemoteError::OfflineReadRejected)) => {}
            other => panic!("expected offline read rejection, got {other:?}"),
        }
        // The read never reached the transport.
        assert_eq!(f.transport.call_count(), 1);
    }

    #[test]
    fn ping_respects_the_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        f.transport.fail_with("down");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );
        let calls_before = f.transport.call_count();

        f.transport.fail_with("still down");
        f.manager.poll(&f.clock);
        assert_eq!(f.transport.call_count(), calls_before + 1);

        // Within the interval no second ping goes out.
        f.clock.advance(5);
        f.manager.poll(&f.clock);
        assert_eq!(f.transport.call_count(), calls_before + 1);

        f.transport.fail_with("still down");
        f.clock.advance(5);
        f.manager.poll(&f.clock);
        assert_eq!(f.transport.call_count(), calls_before + 2);
        assert!(f.manager.is_offline());
    }

    #[test]
    fn successful_ping_replays_queued_writes_and_deletes_them() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        f.transport.fail_with("down");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );
        assert_eq!(f.manager.queued_write_count(), 1);

        // Ping succeeds, then the replayed write succeeds.
        f.transport.respond_with(200, json!({}));
        f.transport.respond_with(201, json!({}));
        f.manager.poll(&f.clock);

        assert!(!f.manager.is_offline());
        assert_eq!(f.manager.queued_write_count(), 0);
        let last = f.transport.calls().last().cloned().unwrap();
        assert_eq!(last.method, Method::Post);
        assert_eq!(last.body, Some(json!({"id": 1})));
    }

    #[test]
    fn failed_replay_keeps_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());

        f.transport.fail_with("down");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );

        // Ping succeeds but the replay hits the dead server again.
        f.transport.respond_with(200, json!({}));
        f.transport.fail_with("down again");
        f.manager.poll(&f.clock);

        assert_eq!(f.manager.queued_write_count(), 1);
        assert!(f.manager.is_offline());
    }

    #[test]
    fn listeners_hear_the_connectivity_transitions() {
        struct Recorder {
            events: Mutex<Vec<&'static str>>,
        }
        impl ConnectivityListener for Recorder {
            fn server_offline(&self) {
                self.events.lock().push("offline");
            }
            fn server_online(&self) {
                self.events.lock().push("online");
            }
            fn sending_queued_changes(&self) {
                self.events.lock().push("sending");
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        f.manager.add_listener(recorder.clone());

        f.transport.fail_with("down");
        f.queue.enqueue(
            HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1})),
            crate::queue::QueueClass::Priority,
            noop(),
        );
        f.transport.respond_with(200, json!({}));
        f.transport.respond_with(200, json!({}));
        f.manager.poll(&f.clock);

        assert_eq!(*recorder.events.lock(), vec!["offline", "online", "sending"]);
    }
}
