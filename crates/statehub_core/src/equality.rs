//! Pluggable per-name item equality.
//!
//! Identity fields differ across collections (numeric id, string id,
//! composite key), so "is this the same item" is a function keyed by state
//! name with a manager-wide default.

use crate::types::{CollectionSpec, Item};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A predicate deciding whether two items represent the same logical entity.
pub type EqualityFn = Arc<dyn Fn(&Item, &Item) -> bool + Send + Sync>;

/// Builds an equality function comparing a single key field.
#[must_use]
pub fn key_field_equality(key_field: &str) -> EqualityFn {
    let field = key_field.to_string();
    Arc::new(move |a, b| match (a.get(&field), b.get(&field)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    })
}

/// Builds an equality function comparing a composite of key fields.
#[must_use]
pub fn composite_equality(key_fields: &[&str]) -> EqualityFn {
    let fields: Vec<String> = key_fields.iter().map(|f| (*f).to_string()).collect();
    Arc::new(move |a, b| {
        fields.iter().all(|f| match (a.get(f), b.get(f)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        })
    })
}

/// Registry of equality functions keyed by state name.
pub struct EqualityRegistry {
    default: EqualityFn,
    by_name: RwLock<HashMap<String, EqualityFn>>,
}

impl EqualityRegistry {
    /// Creates a registry whose default compares an `id` field.
    #[must_use]
    pub fn new() -> Self {
        Self {
            default: key_field_equality("id"),
            by_name: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry seeded from collection specs.
    ///
    /// Each collection gets key-field equality over its configured key field.
    #[must_use]
    pub fn from_specs(specs: &[CollectionSpec]) -> Self {
        let registry = Self::new();
        for spec in specs {
            registry.register(&spec.name, key_field_equality(&spec.key_field));
        }
        registry
    }

    /// Overrides the manager-wide default.
    pub fn set_default(&mut self, equality: EqualityFn) {
        self.default = equality;
    }

    /// Registers an equality function for one state name.
    pub fn register(&self, name: &str, equality: EqualityFn) {
        self.by_name.write().insert(name.to_string(), equality);
    }

    /// Returns the equality function for a state name, falling back to the
    /// default when none is registered.
    #[must_use]
    pub fn for_name(&self, name: &str) -> EqualityFn {
        self.by_name
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl Default for EqualityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Item;
    use serde_json::json;

    fn item(v: serde_json::Value) -> Item {
        Item::from_value(v).unwrap()
    }

    #[test]
    fn key_field_equality_matches_on_key_only() {
        let eq = key_field_equality("id");
        let a = item(json!({"id": 1, "name": "a"}));
        let b = item(json!({"id": 1, "name": "b"}));
        let c = item(json!({"id": 2, "name": "a"}));

        assert!(eq(&a, &b));
        assert!(!eq(&a, &c));
    }

    #[test]
    fn missing_key_never_matches() {
        let eq = key_field_equality("id");
        let keyed = item(json!({"id": 1}));
        let unkeyed = item(json!({"name": "x"}));

        assert!(!eq(&keyed, &unkeyed));
        assert!(!eq(&unkeyed, &unkeyed));
    }

    #[test]
    fn composite_equality_requires_all_fields() {
        let eq = composite_equality(&["tenant", "code"]);
        let a = item(json!({"tenant": "t1", "code": "c1"}));
        let b = item(json!({"tenant": "t1", "code": "c1", "extra": true}));
        let c = item(json!({"tenant": "t2", "code": "c1"}));

        assert!(eq(&a, &b));
        assert!(!eq(&a, &c));
    }

    #[test]
    fn registry_falls_back_to_default() {
        let registry = EqualityRegistry::from_specs(&[CollectionSpec::new("tasks", "taskId")]);

        let by_task_id = registry.for_name("tasks");
        let a = item(json!({"taskId": 7}));
        let b = item(json!({"taskId": 7, "done": true}));
        assert!(by_task_id(&a, &b));

        // Unregistered name uses the id default.
        let default = registry.for_name("unknown");
        let x = item(json!({"id": 3}));
        let y = item(json!({"id": 3}));
        assert!(default(&x, &y));
    }
}
