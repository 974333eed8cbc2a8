//! GraphQL remote adapter.
//!
//! Same shape as the REST adapter, but every call is a POST to a single
//! endpoint carrying an operation document. Each collection configures one
//! query operation plus optional mutations; the response payload is
//! unwrapped by walking the operation's dot-separated data path.

use crate::auth::ContextSupplier;
use crate::queue::{QueueCallback, QueueClass, QueueOutcome, RequestQueue};
use crate::transport::{HttpRequest, Method};
use parking_lot::Mutex;
use serde_json::{json, Value};
use statehub_core::{AsyncFetcher, CoreError, CoreResult, Item, RunHandle};
use std::collections::HashMap;
use std::sync::Arc;

/// One GraphQL operation: the document to send and where the payload lives
/// in the response.
#[derive(Debug, Clone)]
pub struct GraphQlOperation {
    /// The query or mutation document.
    pub document: String,
    /// Dot-separated path to the payload inside the response JSON, e.g.
    /// `data.tasks`.
    pub data_path: String,
}

impl GraphQlOperation {
    /// Creates an operation.
    pub fn new(document: impl Into<String>, data_path: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            data_path: data_path.into(),
        }
    }
}

/// Per-collection operation set.
#[derive(Debug, Clone)]
pub struct GraphQlCollection {
    query: GraphQlOperation,
    create: Option<GraphQlOperation>,
    update: Option<GraphQlOperation>,
    destroy: Option<GraphQlOperation>,
}

impl GraphQlCollection {
    /// Creates a read-only collection with the given query operation.
    #[must_use]
    pub fn query(operation: GraphQlOperation) -> Self {
        Self {
            query: operation,
            create: None,
            update: None,
            destroy: None,
        }
    }

    /// Adds a create mutation.
    #[must_use]
    pub fn with_create(mut self, operation: GraphQlOperation) -> Self {
        self.create = Some(operation);
        self
    }

    /// Adds an update mutation.
    #[must_use]
    pub fn with_update(mut self, operation: GraphQlOperation) -> Self {
        self.update = Some(operation);
        self
    }

    /// Adds a destroy mutation.
    #[must_use]
    pub fn with_destroy(mut self, operation: GraphQlOperation) -> Self {
        self.destroy = Some(operation);
        self
    }
}

/// Walks a dot-separated path into a JSON value.
fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Asynchronous backend over a GraphQL endpoint.
pub struct GraphQlAdapter {
    endpoint: String,
    queue: Arc<RequestQueue>,
    context: Arc<dyn ContextSupplier>,
    collections: HashMap<String, GraphQlCollection>,
}

impl GraphQlAdapter {
    /// Creates an adapter for a single endpoint with no collections.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        queue: Arc<RequestQueue>,
        context: Arc<dyn ContextSupplier>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            queue,
            context,
            collections: HashMap::new(),
        }
    }

    /// Mounts a collection's operation set.
    #[must_use]
    pub fn with_collection(mut self, name: impl Into<String>, collection: GraphQlCollection) -> Self {
        self.collections.insert(name.into(), collection);
        self
    }

    fn collection(&self, name: &str) -> CoreResult<&GraphQlCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| CoreError::NoConfiguration(name.to_string()))
    }

    fn operation_request(&self, operation: &GraphQlOperation, variables: Value) -> HttpRequest {
        let mut variables = variables;
        if let (Some(context), Some(map)) = (self.context.context(), variables.as_object_mut()) {
            map.insert("context".to_string(), context);
        }
        HttpRequest::with_body(
            self.endpoint.clone(),
            Method::Post,
            json!({
                "query": operation.document,
                "variables": variables,
            }),
        )
    }

    fn enqueue_mutation(&self, name: &str, operation: &GraphQlOperation, item: &Item) {
        let request =
            self.operation_request(operation, json!({ "input": item.clone().into_value() }));
        let name = name.to_string();
        let callback: QueueCallback = Arc::new(move |outcome| {
            if let QueueOutcome::Failed(e) = outcome {
                tracing::warn!(state = %name, error = %e, "graphql mutation failed");
            }
        });
        self.queue.enqueue(request, QueueClass::Priority, callback);
    }

    fn mutation<'a>(
        &self,
        name: &str,
        operation: &'a Option<GraphQlOperation>,
    ) -> CoreResult<&'a GraphQlOperation> {
        operation
            .as_ref()
            .ok_or_else(|| CoreError::NoConfiguration(name.to_string()))
    }
}

fn unwrap_items(json: &Value, data_path: &str) -> Result<Vec<Item>, CoreError> {
    let payload = walk(json, data_path).ok_or_else(|| {
        CoreError::Serialization(format!("response has no payload at {data_path:?}"))
    })?;
    match payload {
        Value::Array(values) => values
            .iter()
            .map(|value| Item::from_value(value.clone()))
            .collect(),
        other => Err(CoreError::Serialization(format!(
            "expected an array at {data_path:?}, got {other}"
        ))),
    }
}

impl AsyncFetcher for GraphQlAdapter {
    fn start_fetch(&self, name: &str, run: RunHandle) -> CoreResult<()> {
        let collection = self.collection(name)?;
        let request = self.operation_request(&collection.query, json!({}));
        let data_path = collection.query.data_path.clone();

        let parked = Mutex::new(Some(run));
        let callback: QueueCallback = Arc::new(move |outcome| {
            let Some(run) = parked.lock().take() else {
                return;
            };
            match outcome {
                QueueOutcome::Completed { response, .. } => {
                    match unwrap_items(&response.json, &data_path) {
                        Ok(items) => run.complete(items),
                        Err(e) => run.fail(&e),
                    }
                }
                QueueOutcome::Forbidden(_) => {
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
        let operation = self.mutation(name, &collection.create)?;
        self.enqueue_mutation(name, operation, item);
        Ok(())
    }

    fn update(&self, name: &str, item: &Item) -> CoreResult<()> {
        let collection = self.collection(name)?;
        let operation = self.mutation(name, &collection.update)?;
        self.enqueue_mutation(name, operation, item);
        Ok(())
    }

    fn destroy(&self, name: &str, item: &Item) -> CoreResult<()> {
        let collection = self.collection(name)?;
        let operation = self.mutation(name, &collection.destroy)?;
        self.enqueue_mutation(name, operation, item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuth, StaticContext};
    use crate::transport::MockTransport;
    use statehub_core::{
        AsyncManager, ChangeDelegate, CollectionSpec, EqualityRegistry, StateManager,
    };

    fn item(v: serde_json::Value) -> Item {
        Item::from_value(v).unwrap()
    }

    fn fixture() -> (Arc<MockTransport>, Arc<GraphQlAdapter>) {
        let transport = Arc::new(MockTransport::new());
        let queue = Arc::new(RequestQueue::new(
            transport.clone(),
            Arc::new(StaticAuth::open()),
        ));
        let adapter = Arc::new(
            GraphQlAdapter::new(
                "http://api.example/graphql",
                queue,
                Arc::new(StaticContext::new(json!({"tenant": "t1"}))),
            )
            .with_collection(
                "tasks",
                GraphQlCollection::query(GraphQlOperation::new(
                    "query { tasks { id title } }",
                    "data.tasks",
                ))
                .with_create(GraphQlOperation::new(
                    "mutation($input: TaskInput!) { createTask(input: $input) { id } }",
                    "data.createTask",
                )),
            ),
        );
        (transport, adapter)
    }

    fn manager(adapter: Arc<GraphQlAdapter>) -> AsyncManager {
        let specs = vec![CollectionSpec::keyed_by_id("tasks")];
        AsyncManager::new(
            adapter,
            Arc::new(ChangeDelegate::new()),
            Arc::new(EqualityRegistry::from_specs(&specs)),
            &specs,
        )
    }

    #[test]
    fn query_unwraps_the_data_path() {
        let (transport, adapter) = fixture();
        transport.respond_with(
            200,
            json!({"data": {"tasks": [{"id": 1}, {"id": 2}]}}),
        );

        let manager = manager(adapter);
        manager.state_by_name("tasks");
        assert_eq!(manager.state_by_name("tasks").to_items().len(), 2);

        let call = &transport.calls()[0];
        assert_eq!(call.method, Method::Post);
        let body = call.body.clone().unwrap();
        assert!(body["query"].as_str().unwrap().starts_with("query"));
        assert_eq!(body["variables"]["context"], json!({"tenant": "t1"}));
    }

    #[test]
    fn mutation_carries_the_item_as_input() {
        let (transport, adapter) = fixture();
        transport.respond_with(200, json!({"data": {"createTask": {"id": 9}}}));

        adapter.create("tasks", &item(json!({"id": 9, "title": "z"}))).unwrap();

        let body = transport.calls()[0].body.clone().unwrap();
        assert_eq!(body["variables"]["input"], json!({"id": 9, "title": "z"}));
    }

    #[test]
    fn missing_mutation_is_a_configuration_error() {
        let (transport, adapter) = fixture();
        let result = adapter.update("tasks", &item(json!({"id": 1})));
        assert!(matches!(result, Err(CoreError::NoConfiguration(_))));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn wrong_data_path_fails_the_run() {
        let (transport, adapter) = fixture();
        transport.respond_with(200, json!({"data": {"other": []}}));

        let manager = manager(adapter);
        manager.state_by_name("tasks");
        // The run failed; a later read starts over instead of serving a
        // buffered value.
        assert!(!manager.run_completed("tasks"));
    }

    #[test]
    fn walk_resolves_nested_paths() {
        let value = json!({"a": {"b": {"c": [1]}}});
        assert_eq!(walk(&value, "a.b.c"), Some(&json!([1])));
        assert_eq!(walk(&value, "a.x"), None);
    }
}
