//! Rows, nodes, and key helpers shared by sources, operators, and views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// A replicated row: column name to value. Ordered for deterministic
/// serialization and so that rows themselves are totally ordered.
pub type Row = BTreeMap<String, Value>;

/// Values of a row's primary-key columns, in primary-key order.
pub type RowKey = Vec<Value>;

/// Column-equality constraint used by constrained fetches.
pub type Constraint = BTreeMap<String, Value>;

/// A row plus its related child nodes, keyed by relationship name.
///
/// Nodes mirror the shape of a query: a top-level `issue` node carries its
/// `comments` relationship, each comment node may carry its own relationships,
/// and so on. Relationship vectors are ordered by the child schema's sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub row: Row,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Vec<Node>>,
}

impl Node {
    /// Creates a node without relationships.
    #[must_use]
    pub fn new(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a relationship on this node.
    #[must_use]
    pub fn with_relationship(mut self, name: impl Into<String>, children: Vec<Node>) -> Self {
        self.relationships.insert(name.into(), children);
        self
    }
}

/// Builds a row from `(column, value)` pairs.
pub fn make_row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Extracts the key values for `columns`. Missing columns read as `null`.
#[must_use]
pub fn row_key(row: &Row, columns: &[String]) -> RowKey {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Join-style equality: `null` never equals anything, including `null`.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a == b
}

/// Whether `row` satisfies every column in `constraint`.
#[must_use]
pub fn constraint_matches(row: &Row, constraint: &Constraint) -> bool {
    constraint
        .iter()
        .all(|(column, value)| row.get(column).is_some_and(|v| values_equal(v, value)))
}

/// Whether two rows agree on every column in `columns` (join-style equality).
#[must_use]
pub fn rows_equal_on(a: &Row, b: &Row, columns: &[String]) -> bool {
    columns.iter().all(|c| match (a.get(c), b.get(c)) {
        (Some(x), Some(y)) => values_equal(x, y),
        _ => false,
    })
}

/// Builds a constraint mapping `target[i]` to `row[source[i]]`.
///
/// Returns `None` if any source value is `null`, since a null join value can
/// never match.
#[must_use]
pub fn correlate(row: &Row, source: &[String], target: &[String]) -> Option<Constraint> {
    let mut constraint = Constraint::new();
    for (s, t) in source.iter().zip(target) {
        let value = row.get(s).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            return None;
        }
        constraint.insert(t.clone(), value);
    }
    Some(constraint)
}

/// Renders a row key for error messages and logs.
#[must_use]
pub fn display_key(key: &RowKey) -> String {
    let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_reads_missing_columns_as_null() {
        let row = make_row([("id", 1)]);
        let key = row_key(&row, &["id".to_string(), "other".to_string()]);
        assert_eq!(key, vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn null_never_satisfies_constraint() {
        let row = make_row([("owner", Value::Null)]);
        let mut constraint = Constraint::new();
        constraint.insert("owner".into(), Value::Null);
        assert!(!constraint_matches(&row, &constraint));
    }

    #[test]
    fn correlate_maps_columns() {
        let row = make_row([("id", Value::from(7)), ("owner", Value::from("u1"))]);
        let c = correlate(&row, &["owner".to_string()], &["userID".to_string()]).unwrap();
        assert_eq!(c.get("userID"), Some(&Value::from("u1")));

        let orphan = make_row([("owner", Value::Null)]);
        assert!(correlate(&orphan, &["owner".to_string()], &["userID".to_string()]).is_none());
    }

    #[test]
    fn node_serialization_omits_empty_relationships() {
        let node = Node::new(make_row([("id", 1)]));
        assert_eq!(serde_json::to_string(&node).unwrap(), r#"{"row":{"id":1}}"#);
    }
}
