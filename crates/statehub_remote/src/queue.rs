//! The request queue.
//!
//! All remote traffic funnels through here. Requests carry a correlation id
//! and a completion callback; two FIFO lanes (priority, background) drain
//! whenever the auth gate is open, priority first, re-evaluated after every
//! dequeue so a priority request enqueued mid-drain still wins. Completion
//! routing: 500-class responses and transport failures hand the original
//! request to the offline handler, 403-class responses trigger a token
//! refresh and a priority requeue of the original request.

use crate::auth::AuthProvider;
use crate::error::RemoteError;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Which lane a request joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    /// Drained first; used for user-visible work and offline replay.
    Priority,
    /// Drained once the priority lane is empty.
    Background,
}

/// The outcome delivered to a request's callback.
#[derive(Debug)]
pub enum QueueOutcome {
    /// The server answered with a non-error status.
    Completed {
        /// The server's response.
        response: HttpResponse,
        /// True when this request was replayed from the offline queue.
        was_offline: bool,
    },
    /// The server rejected the call as unauthorized. The original request
    /// has already been requeued with priority after a token refresh.
    Forbidden(HttpResponse),
    /// The request failed and will not be retried by the queue.
    Failed(RemoteError),
}

/// Completion callback for one queued request.
pub type QueueCallback = Arc<dyn Fn(QueueOutcome) + Send + Sync>;

/// Receives requests the server could not be reached for.
///
/// Implemented by the offline manager; while it reports offline, the queue
/// routes new requests straight to it instead of the transport.
pub trait UnreachableHandler: Send + Sync {
    /// True while the server is known to be unreachable.
    fn is_offline(&self) -> bool;

    /// Takes over a request the transport could not deliver.
    ///
    /// `was_offline` marks a replayed request whose envelope is still
    /// persisted; the handler must not queue it a second time.
    fn server_unreachable(&self, request: HttpRequest, callback: QueueCallback, was_offline: bool);
}

struct QueueItem {
    id: Uuid,
    request: HttpRequest,
    callback: QueueCallback,
    was_offline: bool,
    retried_after_refresh: bool,
}

/// Two-lane FIFO request queue with auth gating.
pub struct RequestQueue {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    priority: Mutex<VecDeque<QueueItem>>,
    background: Mutex<VecDeque<QueueItem>>,
    in_progress: Mutex<HashMap<Uuid, HttpRequest>>,
    offline_handler: RwLock<Option<Arc<dyn UnreachableHandler>>>,
    draining: AtomicBool,
}

impl RequestQueue {
    /// Creates a queue over the given transport and auth collaborator.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            transport,
            auth,
            priority: Mutex::new(VecDeque::new()),
            background: Mutex::new(VecDeque::new()),
            in_progress: Mutex::new(HashMap::new()),
            offline_handler: RwLock::new(None),
            draining: AtomicBool::new(false),
        }
    }

    /// Installs the offline handler.
    ///
    /// Set after construction since the offline manager itself replays
    /// through this queue.
    pub fn set_offline_handler(&self, handler: Arc<dyn UnreachableHandler>) {
        *self.offline_handler.write() = Some(handler);
    }

    /// Queues a request and drains if the gate is open.
    ///
    /// Returns the correlation id assigned to the request. While the server
    /// is known offline the request bypasses the transport and goes to the
    /// offline handler directly.
    pub fn enqueue(
        &self,
        request: HttpRequest,
        class: QueueClass,
        callback: QueueCallback,
    ) -> Uuid {
        self.enqueue_item(request, class, callback, false)
    }

    /// Queues an offline-replayed request with priority.
    ///
    /// Its completion carries `was_offline = true` so subscribers can tell
    /// replayed work from fresh work.
    pub fn enqueue_replay(&self, request: HttpRequest, callback: QueueCallback) -> Uuid {
        self.enqueue_item(request, QueueClass::Priority, callback, true)
    }

    fn enqueue_item(
        &self,
        request: HttpRequest,
        class: QueueClass,
        callback: QueueCallback,
        was_offline: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();

        if !was_offline && self.known_offline() {
            if let Some(handler) = self.offline_handler.read().clone() {
                handler.server_unreachable(request, callback, false);
                return id;
            }
        }

        let item = QueueItem {
            id,
            request,
            callback,
            was_offline,
            retried_after_refresh: false,
        };
        match class {
            QueueClass::Priority => self.priority.lock().push_back(item),
            QueueClass::Background => self.background.lock().push_back(item),
        }

        if self.can_proceed() {
            self.drain();
        }
        id
    }

    /// Reopens the gate after a token arrived and drains pending work.
    pub fn token_became_available(&self) {
        self.drain();
    }

    /// True when the auth gate allows requests to leave the queue.
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        !(self.auth.calls_require_token() && !self.auth.has_token())
    }

    /// Number of requests waiting in the priority lane.
    #[must_use]
    pub fn priority_len(&self) -> usize {
        self.priority.lock().len()
    }

    /// Number of requests waiting in the background lane.
    #[must_use]
    pub fn background_len(&self) -> usize {
        self.background.lock().len()
    }

    /// Number of requests currently at the transport.
    #[must_use]
    pub fn in_progress_len(&self) -> usize {
        self.in_progress.lock().len()
    }

    fn known_offline(&self) -> bool {
        self.offline_handler
            .read()
            .as_ref()
            .is_some_and(|h| h.is_offline())
    }

    fn pop_next(&self) -> Option<QueueItem> {
        if let Some(item) = self.priority.lock().pop_front() {
            return Some(item);
        }
        self.background.lock().pop_front()
    }

    /// Drains both lanes, priority first.
    ///
    /// Re-evaluates the lanes after every dequeue. Reentrant calls (a
    /// callback enqueueing more work) return immediately; the outer drain
    /// picks the new work up.
    pub fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.can_proceed() && !self.known_offline() {
            let Some(item) = self.pop_next() else {
                break;
            };
            self.execute(item);
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    fn execute(&self, item: QueueItem) {
        self.in_progress.lock().insert(item.id, item.request.clone());
        let result = self.transport.call(&item.request);
        self.in_progress.lock().remove(&item.id);

        match result {
            Ok(response) if response.is_forbidden() => self.handle_forbidden(item, response),
            Ok(response) if response.is_server_error() => {
                self.handle_unreachable(item, RemoteError::Unreachable(format!(
                    "status {}",
                    response.status
                )));
            }
            Ok(response) => (item.callback)(QueueOutcome::Completed {
                response,
                was_offline: item.was_offline,
            }),
            Err(error) => self.handle_unreachable(item, error),
        }
    }

    fn handle_forbidden(&self, item: QueueItem, response: HttpResponse) {
        if item.retried_after_refresh {
            tracing::warn!(url = %item.request.url, "still forbidden after token refresh");
            (item.callback)(QueueOutcome::Forbidden(response));
            return;
        }

        tracing::debug!(url = %item.request.url, "forbidden, refreshing token and requeueing");
        self.auth.refresh_token();
        self.priority.lock().push_back(QueueItem {
            id: item.id,
            request: item.request,
            callback: Arc::clone(&item.callback),
            was_offline: item.was_offline,
            retried_after_refresh: true,
        });
        (item.callback)(QueueOutcome::Forbidden(response));
    }

    fn handle_unreachable(&self, item: QueueItem, error: RemoteError) {
        match self.offline_handler.read().clone() {
            Some(handler) => {
                tracing::warn!(url = %item.request.url, error = %error, "handing request to offline handler");
                handler.server_unreachable(item.request, item.callback, item.was_offline);
            }
            None => (item.callback)(QueueOutcome::Failed(error)),
        }
    }
}
