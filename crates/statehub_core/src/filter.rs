//! Filtered query engine.
//!
//! A query is a list of attribute/operator/value triples. The engine groups
//! filters into three classes:
//!
//! - **exact**: equality against a value set (several `Equals` filters on
//!   one attribute form the set),
//! - **conditional**: relational operators and null checks,
//! - **partial**: case-insensitive substring over one or more fields,
//!
//! combines each class with a configurable AND/OR logic, and ANDs the
//! classes together. A field missing from an item is a non-match, except
//! that `IsNull` against a missing field is a match.

use crate::types::Item;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Comparison operator of one filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Exact equality (value-set semantics across repeated attributes).
    Equals,
    /// Strictly less than.
    LessThan,
    /// Less than or equal.
    LessThanOrEqual,
    /// Strictly greater than.
    GreaterThan,
    /// Greater than or equal.
    GreaterThanOrEqual,
    /// Field is null or absent.
    IsNull,
    /// Field is present and non-null.
    IsNotNull,
    /// Case-insensitive substring match.
    Contains,
}

impl FilterOperator {
    fn is_exact(self) -> bool {
        matches!(self, FilterOperator::Equals)
    }

    fn is_partial(self) -> bool {
        matches!(self, FilterOperator::Contains)
    }
}

/// One attribute/operator/value triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// The item attribute the filter applies to.
    pub attribute: String,
    /// The comparison operator.
    pub operator: FilterOperator,
    /// The comparison value. Ignored for the null-check operators.
    pub value: Value,
}

impl Filter {
    /// Creates a filter.
    pub fn new(attribute: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value,
        }
    }

    /// Shorthand for an exact-match filter.
    pub fn equals(attribute: impl Into<String>, value: Value) -> Self {
        Self::new(attribute, FilterOperator::Equals, value)
    }

    /// Shorthand for a case-insensitive substring filter.
    pub fn contains(attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::new(attribute, FilterOperator::Contains, Value::String(needle.into()))
    }
}

/// How matches within one filter class are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLogic {
    /// Every filter in the class must match.
    All,
    /// At least one filter in the class must match.
    Any,
}

impl MatchLogic {
    fn combine(self, matches: impl Iterator<Item = bool>) -> bool {
        let mut iter = matches.peekable();
        if iter.peek().is_none() {
            return true;
        }
        match self {
            MatchLogic::All => iter.all(|m| m),
            MatchLogic::Any => iter.any(|m| m),
        }
    }
}

/// Per-class combination logic for one query engine.
#[derive(Debug, Clone, Copy)]
pub struct FilterEngine {
    /// Combination logic for exact-match attribute groups.
    pub exact_logic: MatchLogic,
    /// Combination logic for conditional filters.
    pub conditional_logic: MatchLogic,
    /// Combination logic for partial-match filters.
    pub partial_logic: MatchLogic,
}

impl FilterEngine {
    /// Creates an engine with the given logic for every class.
    #[must_use]
    pub fn with_logic(logic: MatchLogic) -> Self {
        Self {
            exact_logic: logic,
            conditional_logic: logic,
            partial_logic: logic,
        }
    }

    /// Sets the partial-match logic.
    #[must_use]
    pub fn with_partial_logic(mut self, logic: MatchLogic) -> Self {
        self.partial_logic = logic;
        self
    }

    /// Applies a list of filters to the items, preserving input order.
    #[must_use]
    pub fn apply(&self, items: &[Item], filters: &[Filter]) -> Vec<Item> {
        if filters.is_empty() {
            return items.to_vec();
        }

        // Exact filters on the same attribute form a value set.
        let mut exact_groups: HashMap<&str, Vec<&Value>> = HashMap::new();
        let mut conditional = Vec::new();
        let mut partial = Vec::new();
        for filter in filters {
            if filter.operator.is_exact() {
                exact_groups
                    .entry(filter.attribute.as_str())
                    .or_default()
                    .push(&filter.value);
            } else if filter.operator.is_partial() {
                partial.push(filter);
            } else {
                conditional.push(filter);
            }
        }

        items
            .iter()
            .filter(|item| {
                let exact = self.exact_logic.combine(
                    exact_groups
                        .iter()
                        .map(|(attribute, set)| exact_match(item, attribute, set)),
                );
                let cond = self
                    .conditional_logic
                    .combine(conditional.iter().map(|f| conditional_match(item, f)));
                let part = self
                    .partial_logic
                    .combine(partial.iter().map(|f| partial_match(item, f)));
                exact && cond && part
            })
            .cloned()
            .collect()
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::with_logic(MatchLogic::All).with_partial_logic(MatchLogic::Any)
    }
}

fn exact_match(item: &Item, attribute: &str, value_set: &[&Value]) -> bool {
    match item.get(attribute) {
        Some(actual) if !actual.is_null() => value_set.iter().any(|v| *v == actual),
        _ => false,
    }
}

fn conditional_match(item: &Item, filter: &Filter) -> bool {
    let actual = item.get(&filter.attribute);
    match filter.operator {
        FilterOperator::IsNull => actual.is_none() || actual.is_some_and(Value::is_null),
        FilterOperator::IsNotNull => actual.is_some_and(|v| !v.is_null()),
        relational => {
            let Some(actual) = actual.filter(|v| !v.is_null()) else {
                return false;
            };
            let Some(ordering) = compare_values(actual, &filter.value) else {
                return false;
            };
            match relational {
                FilterOperator::LessThan => ordering == Ordering::Less,
                FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                FilterOperator::GreaterThan => ordering == Ordering::Greater,
                FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                _ => false,
            }
        }
    }
}

fn partial_match(item: &Item, filter: &Filter) -> bool {
    let Some(needle) = filter.value.as_str() else {
        return false;
    };
    let haystack = match item.get(&filter.attribute) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return false,
    };
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Orders two JSON scalars when they are comparable.
///
/// Numbers compare numerically, strings lexicographically. Mixed or
/// non-scalar operands are incomparable and yield `None`.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
