//! Core value types: items, state values and collection specifications.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record in a collection.
///
/// Items are JSON objects. Every collection declares the field its items are
/// keyed by (see [`CollectionSpec`]); identity between two items is decided
/// by the collection's equality function, not by full structural equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(Map<String, Value>);

impl Item {
    /// Creates an item from a JSON object map.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Creates an item from any JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a JSON object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::Serialization(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Returns the value of a field, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field on the item.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Returns the underlying JSON object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts the item into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Returns the item's key under the given key field, rendered as a string.
    ///
    /// Numeric and string keys are both supported since identity fields
    /// differ across collections.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MissingKeyField`] if the field is absent or null.
    pub fn key_string(&self, collection: &str, key_field: &str) -> CoreResult<String> {
        match self.0.get(key_field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            _ => Err(CoreError::MissingKeyField {
                collection: collection.to_string(),
                key_field: key_field.to_string(),
            }),
        }
    }
}

/// The value held by one state record.
///
/// `Unset` encodes "this name has never been set"; callers that need the
/// distinction check [`StateValue::is_set`] rather than a separate flag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum StateValue {
    /// The state has never been set.
    #[default]
    Unset,
    /// A single item.
    One(Item),
    /// An ordered collection of items.
    Many(Vec<Item>),
}

impl StateValue {
    /// Returns true once the state has been set at least once.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !matches!(self, StateValue::Unset)
    }

    /// Returns the items held by this value, cloning as needed.
    ///
    /// `Unset` yields an empty vector and `One` a single-element vector.
    #[must_use]
    pub fn to_items(&self) -> Vec<Item> {
        match self {
            StateValue::Unset => Vec::new(),
            StateValue::One(item) => vec![item.clone()],
            StateValue::Many(items) => items.clone(),
        }
    }

    /// Wraps a vector of items, preserving order.
    #[must_use]
    pub fn from_items(items: Vec<Item>) -> Self {
        StateValue::Many(items)
    }
}

/// Configuration for one named collection.
///
/// One spec exists per state name; it names the field items are keyed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// The state name this spec configures.
    pub name: String,
    /// The field items of this collection are keyed by.
    pub key_field: String,
}

impl CollectionSpec {
    /// Creates a spec for a collection keyed by `key_field`.
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
        }
    }

    /// Creates a spec for a collection keyed by an `id` field.
    pub fn keyed_by_id(name: impl Into<String>) -> Self {
        Self::new(name, "id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn item(value: Value) -> Item {
        Item::from_value(value).unwrap()
    }

    #[test]
    fn item_key_string_variants() {
        let string_keyed = item(json!({"id": "abc"}));
        assert_eq!(string_keyed.key_string("c", "id").unwrap(), "abc");

        let numeric_keyed = item(json!({"id": 42}));
        assert_eq!(numeric_keyed.key_string("c", "id").unwrap(), "42");
    }

    #[test]
    fn item_missing_key_field() {
        let no_key = item(json!({"name": "x"}));
        let err = no_key.key_string("tasks", "id").unwrap_err();
        assert!(matches!(err, CoreError::MissingKeyField { .. }));
    }

    #[test]
    fn item_rejects_non_object() {
        assert!(Item::from_value(json!([1, 2, 3])).is_err());
        assert!(Item::from_value(json!("scalar")).is_err());
    }

    #[test]
    fn state_value_set_tracking() {
        assert!(!StateValue::Unset.is_set());
        assert!(StateValue::Many(vec![]).is_set());
        assert!(StateValue::One(item(json!({"id": 1}))).is_set());
    }

    #[test]
    fn state_value_to_items() {
        assert!(StateValue::Unset.to_items().is_empty());

        let single = StateValue::One(item(json!({"id": 1})));
        assert_eq!(single.to_items().len(), 1);

        let many = StateValue::from_items(vec![item(json!({"id": 1})), item(json!({"id": 2}))]);
        assert_eq!(many.to_items().len(), 2);
    }
}
