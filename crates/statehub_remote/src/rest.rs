//! REST remote adapter.
//!
//! Mounts a REST API as an asynchronous backend: fetches and writes go
//! through the request queue, so auth gating, offline queuing and 403
//! retries all apply. Each collection declares which verbs its API actually
//! supports via [`ApiFeatures`]; unsupported operations fail with a
//! configuration error instead of hitting the server.
//!
//! The application context is merged into write bodies under a `context`
//! key and carried as the `X-App-Context` header on reads and deletes.

use crate::auth::ContextSupplier;
use crate::error::{RemoteError, RemoteResult};
use crate::queue::{QueueCallback, QueueClass, QueueOutcome, RequestQueue};
use crate::transport::{HttpRequest, Method};
use parking_lot::Mutex;
use serde_json::Value;
use statehub_core::{
    AsyncFetcher, ChangeDelegate, CoreError, CoreResult, Item, RunHandle, StateEvent,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Header carrying the application context on bodyless requests.
pub const CONTEXT_HEADER: &str = "X-App-Context";
/// Header carrying the caller's last-known modification time.
pub const IF_MODIFIED_HEADER: &str = "X-If-Modified-Since-Epoch";

/// Which verbs a collection's API supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiFeatures {
    /// GET the whole collection.
    pub find_all: bool,
    /// POST new items.
    pub create: bool,
    /// PUT replacements.
    pub update: bool,
    /// DELETE items.
    pub destroy: bool,
    /// GET a single item by key.
    pub find: bool,
    /// Conditional fetches by modification time.
    pub last_modified: bool,
}

impl ApiFeatures {
    /// No verbs supported.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Every verb supported.
    #[must_use]
    pub fn all() -> Self {
        Self {
            find_all: true,
            create: true,
            update: true,
            destroy: true,
            find: true,
            last_modified: true,
        }
    }

    /// Read-only: `find_all` and `find`.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            find_all: true,
            find: true,
            ..Self::default()
        }
    }

    /// Enables `find_all`.
    #[must_use]
    pub fn with_find_all(mut self) -> Self {
        self.find_all = true;
        self
    }

    /// Enables `create`.
    #[must_use]
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Enables `update`.
    #[must_use]
    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    /// Enables `destroy`.
    #[must_use]
    pub fn with_destroy(mut self) -> Self {
        self.destroy = true;
        self
    }

    /// Enables `find`.
    #[must_use]
    pub fn with_find(mut self) -> Self {
        self.find = true;
        self
    }

    /// Enables `last_modified`.
    #[must_use]
    pub fn with_last_modified(mut self) -> Self {
        self.last_modified = true;
        self
    }
}

struct RestCollection {
    path: String,
    key_field: String,
    features: ApiFeatures,
}

/// Asynchronous backend over a REST API.
pub struct RestAdapter {
    base_url: String,
    queue: Arc<RequestQueue>,
    context: Arc<dyn ContextSupplier>,
    collections: HashMap<String, RestCollection>,
}

impl RestAdapter {
    /// Creates an adapter rooted at `base_url` with no collections.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        queue: Arc<RequestQueue>,
        context: Arc<dyn ContextSupplier>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            queue,
            context,
            collections: HashMap::new(),
        }
    }

    /// Mounts a collection at `path` under the base URL.
    #[must_use]
    pub fn with_collection(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        key_field: impl Into<String>,
        features: ApiFeatures,
    ) -> Self {
        self.collections.insert(
            name.into(),
            RestCollection {
                path: path.into().trim_matches('/').to_string(),
                key_field: key_field.into(),
                features,
            },
        );
        self
    }

    fn collection(&self, name: &str) -> CoreResult<&RestCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| CoreError::NoConfiguration(name.to_string()))
    }

    fn collection_url(&self, collection: &RestCollection) -> String {
        format!("{}/{}", self.base_url, collection.path)
    }

    fn item_url(&self, name: &str, collection: &RestCollection, item: &Item) -> CoreResult<String> {
        let key = item.key_string(name, &collection.key_field)?;
        Ok(format!("{}/{}/{key}", self.base_url, collection.path))
    }

    fn read_request(&self, url: String) -> HttpRequest {
        let mut request = HttpRequest::get(url);
        if let Some(context) = self.context.context() {
            request = request.header(CONTEXT_HEADER, context.to_string());
        }
        request
    }

    fn write_body(&self, item: &Item) -> Value {
        let mut body = item.clone().into_value();
        if let (Some(context), Some(map)) = (self.context.context(), body.as_object_mut()) {
            map.insert("context".to_string(), context);
        }
        body
    }

    /// Conditionally re-fetches one item, informing the delegate.
    ///
    /// Sends the item's last-known modification time; a 304 answer emits
    /// `ItemNotModified`, a fresh body emits `ItemUpdated` with the stale
    /// item as the previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown, lacks the `find` and
    /// `last_modified` features, or the item has no key.
    pub fn fetch_item_if_modified(
        &self,
        name: &str,
        item: &Item,
        since_epoch_secs: u64,
        delegate: Arc<ChangeDelegate>,
    ) -> RemoteResult<()> {
        let collection = self.collection(name)?;
        if !(collection.features.find && collection.features.last_modified) {
            return Err(RemoteError::NoConfiguration(name.to_string()));
        }

        let request = self
            .read_request(self.item_url(name, collection, item)?)
            .header(IF_MODIFIED_HEADER, since_epoch_secs.to_string());
        let name = name.to_string();
        let stale = item.clone();
        let callback: QueueCallback = Arc::new(move |outcome| match outcome {
            QueueOutcome::Completed { response, .. } if response.is_not_modified() => {
                delegate.inform(&name, StateEvent::ItemNotModified { item: &stale });
            }
            QueueOutcome::Completed { response, .. } => {
                match Item::from_value(response.json.clone()) {
                    Ok(fresh) => delegate.inform(
                        &name,
                        StateEvent::ItemUpdated {
                            item: &fresh,
                            previous: Some(&stale),
                        },
                    ),
                    Err(e) => {
                        tracing::warn!(state = %name, error = %e, "conditional fetch body undecodable");
                    }
                }
            }
            QueueOutcome::Forbidden(_) => {}
            QueueOutcome::Failed(e) => {
                tracing::warn!(state = %name, error = %e, "conditional fetch failed");
            }
        });
        self.queue.enqueue(request, QueueClass::Background, callback);
        Ok(())
    }

    fn enqueue_write(&self, name: &str, request: HttpRequest) {
        let name = name.to_string();
        let url = request.url.clone();
        let callback: QueueCallback = Arc::new(move |outcome| {
            if let QueueOutcome::Failed(e) = outcome {
                tracing::warn!(state = %name, url = %url, error = %e, "remote write failed");
            }
        });
        self.queue.enqueue(request, QueueClass::Priority, callback);
    }
}

/// Decodes a collection response body into items.
///
/// Accepts a bare array or an object with an `items` array.
fn parse_items(json: &Value) -> Result<Vec<Item>, CoreError> {
    let array = match json {
        Value::Array(values) => values,
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(values)) => values,
            _ => {
                return Err(CoreError::Serialization(
                    "expected an array response body".into(),
                ))
            }
        },
        _ => {
            return Err(CoreError::Serialization(
                "expected an array response body".into(),
            ))
        }
    };
    array
        .iter()
        .map(|value| Item::from_value(value.clone()))
        .collect()
}

impl AsyncFetcher for RestAdapter {
    fn start_fetch(&self, name: &str, run: RunHandle) -> CoreResult<()> {
        let collection = self.collection(name)?;
        if !collection.features.find_all {
            return Err(CoreError::NoConfiguration(name.to_string()));
        }

        let request = self.read_request(self.collection_url(collection));
        let parked = Mutex::new(Some(run));
        let callback: QueueCallback = Arc::new(move |outcome| {
            let Some(run) = parked.lock().take() else {
                return;
            };
            match outcome {
                QueueOutcome::Completed { response, .. } => match parse_items(&response.json) {
                    Ok(items) => run.complete(items),
                    Err(e) => run.fail(&e),
                },
                QueueOutcome::Forbidden(_) => {
                    // The queue requeued the request; park the run for the
                    // retry's outcome.
                    *parked.lock() = Some(run);
                }
                QueueOutcome::Failed(e) => run.fail(&CoreError::Storage(e.to_string())),
            }
        });
        self.queue.enqueue(request, QueueClass::Priority, callback);
        Ok(())
    }

    fn create(&self, name: &str, item: &Item) -> CoreResult<()> {
        let collection = self.collection(name)?;
        if !collection.features.create {
            return Err(CoreError::NoConfiguration(name.to_string()));
        }
        let request = HttpRequest::with_body(
            self.collection_url(collection),
            Method::Post,
            self.write_body(item),
        );
        self.enqueue_write(name, request);
        Ok(())
    }

    fn update(&self, name: &str, item: &Item) -> CoreResult<()> {
        let collection = self.collection(name)?;
        if !collection.features.update {
            return Err(CoreError::NoConfiguration(name.to_string()));
        }
        let request = HttpRequest::with_body(
            self.item_url(name, collection, item)?,
            Method::Put,
            self.write_body(item),
        );
        self.enqueue_write(name, request);
        Ok(())
    }

    fn destroy(&self, name: &str, item: &Item) -> CoreResult<()> {
        let collection = self.collection(name)?;
        if !collection.features.destroy {
            return Err(CoreError::NoConfiguration(name.to_string()));
        }
        let url = self.item_url(name, collection, item)?;
        let mut request = HttpRequest {
            url,
            method: Method::Delete,
            headers: Vec::new(),
            body: None,
        };
        if let Some(context) = self.context.context() {
            request = request.header(CONTEXT_HEADER, context.to_string());
        }
        self.enqueue_write(name, request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuth, StaticContext};
    use crate::transport::MockTransport;
    use serde_json::json;
    use statehub_core::{AsyncManager, ChangeListener, CollectionSpec, EqualityRegistry,
        StateManager, StateValue};

    fn item(v: serde_json::Value) -> Item {
        Item::from_value(v).unwrap()
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        adapter: Arc<RestAdapter>,
    }

    fn fixture(context: StaticContext) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(RequestQueue::new(
            transport.clone(),
            Arc::new(StaticAuth::open()),
        ));
        let adapter = Arc::new(
            RestAdapter::new("http://api.example/v1/", queue, Arc::new(context))
                .with_collection("tasks", "tasks", "id", ApiFeatures::all()),
        );
        Fixture { transport, adapter }
    }

    fn manager(adapter: Arc<RestAdapter>) -> AsyncManager {
        let specs = vec![CollectionSpec::keyed_by_id("tasks")];
        AsyncManager::new(
            adapter,
            Arc::new(ChangeDelegate::new()),
            Arc::new(EqualityRegistry::from_specs(&specs)),
            &specs,
        )
    }

    #[test]
    fn find_all_parses_array_body_into_state() {
        let f = fixture(StaticContext::empty());
        f.transport
            .respond_with(200, json!([{"id": 1}, {"id": 2}]));

        let manager = manager(f.adapter.clone());
        manager.state_by_name("tasks");
        let items = manager.state_by_name("tasks").to_items();
        assert_eq!(items.len(), 2);

        let call = &f.transport.calls()[0];
        assert_eq!(call.url, "http://api.example/v1/tasks");
        assert_eq!(call.method, Method::Get);
    }

    #[test]
    fn context_rides_header_on_reads_and_body_on_writes() {
        let f = fixture(StaticContext::new(json!({"tenant": "t1"})));
        f.transport.respond_with(200, json!([]));
        f.transport.respond_with(201, json!({}));

        let manager = manager(f.adapter.clone());
        manager.state_by_name("tasks");
        manager.add_item_to_state("tasks", item(json!({"id": 5, "title": "x"})), false);

        let calls = f.transport.calls();
        let read_header = calls[0]
            .headers
            .iter()
            .find(|(n, _)| n == CONTEXT_HEADER)
            .cloned();
        assert!(read_header.is_some());

        let body = calls[1].body.clone().unwrap();
        assert_eq!(body["context"], json!({"tenant": "t1"}));
        assert_eq!(body["title"], json!("x"));
    }

    #[test]
    fn update_and_destroy_address_the_item_by_key() {
        let f = fixture(StaticContext::empty());
        f.transport.respond_with(200, json!({}));
        f.transport.respond_with(204, json!(null));

        let manager = manager(f.adapter.clone());
        manager.update_item_in_state("tasks", item(json!({"id": 7, "title": "y"})));
        manager.remove_item_from_state("tasks", item(json!({"id": 7})));

        let calls = f.transport.calls();
        assert_eq!(calls[0].url, "http://api.example/v1/tasks/7");
        assert_eq!(calls[0].method, Method::Put);
        assert_eq!(calls[1].url, "http://api.example/v1/tasks/7");
        assert_eq!(calls[1].method, Method::Delete);
    }

    #[test]
    fn disabled_verbs_never_reach_the_server() {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(RequestQueue::new(
            transport.clone(),
            Arc::new(StaticAuth::open()),
        ));
        let adapter = RestAdapter::new(
            "http://api.example",
            queue,
            Arc::new(StaticContext::empty()),
        )
        .with_collection("tasks", "tasks", "id", ApiFeatures::read_only());

        assert!(adapter.create("tasks", &item(json!({"id": 1}))).is_err());
        assert!(adapter.destroy("tasks", &item(json!({"id": 1}))).is_err());
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn fetch_resumes_after_forbidden_retry() {
        let f = fixture(StaticContext::empty());
        f.transport.respond_with(403, json!({}));
        f.transport.respond_with(200, json!([{"id": 1}]));

        let manager = manager(f.adapter.clone());
        manager.state_by_name("tasks");

        // The retried request completed the original run.
        let items = manager.state_by_name("tasks").to_items();
        assert_eq!(items.len(), 1);
        assert_eq!(f.transport.call_count(), 2);
    }

    #[test]
    fn object_body_with_items_array_is_accepted() {
        assert_eq!(
            parse_items(&json!({"items": [{"id": 1}]})).unwrap().len(),
            1
        );
        assert!(parse_items(&json!("nope")).is_err());
    }

    #[test]
    fn conditional_fetch_emits_not_modified_on_304() {
        struct Capture {
            not_modified: Mutex<Vec<String>>,
            updated: Mutex<Vec<Item>>,
        }
        impl ChangeListener for Capture {
            fn item_not_modified(&self, name: &str, _item: &Item) {
                self.not_modified.lock().push(name.to_string());
            }
            fn item_updated(&self, _name: &str, item: &Item, _previous: Option<&Item>) {
                self.updated.lock().push(item.clone());
            }
            fn state_changed(&self, _name: &str, _value: &StateValue) {}
        }

        let f = fixture(StaticContext::empty());
        let delegate = Arc::new(ChangeDelegate::new());
        let capture = Arc::new(Capture {
            not_modified: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
        });
        delegate.add_listener("tasks", capture.clone());

        let stale = item(json!({"id": 3, "title": "old"}));

        f.transport.respond_with(304, json!(null));
        f.adapter
            .fetch_item_if_modified("tasks", &stale, 1_000, delegate.clone())
            .unwrap();
        assert_eq!(*capture.not_modified.lock(), vec!["tasks"]);

        f.transport.respond_with(200, json!({"id": 3, "title": "new"}));
        f.adapter
            .fetch_item_if_modified("tasks", &stale, 1_000, delegate)
            .unwrap();
        let updated = capture.updated.lock();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].get("title"), Some(&json!("new")));

        let call = f.transport.calls().pop().unwrap();
        assert_eq!(call.url, "http://api.example/v1/tasks/3");
        assert!(call
            .headers
            .iter()
            .any(|(n, v)| n == IF_MODIFIED_HEADER && v == "1000"));
    }
}
