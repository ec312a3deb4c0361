//! Table specs, sort orders, and the schema every operator exposes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::Row;
use crate::types::{compare_values, Value};

/// Sort direction for a single ordering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One `(column, direction)` element of an ordering.
pub type OrderPart = (String, Direction);

/// An ordering: compared left to right, first difference wins.
pub type OrderBy = Vec<OrderPart>;

/// Declared type of a replicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Number,
    String,
    Null,
    Json,
}

/// Static description of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub name: String,
    pub columns: BTreeMap<String, ColumnType>,
    pub primary_key: Vec<String>,
}

impl TableSpec {
    /// Creates a spec from column definitions and a primary key.
    pub fn new<I, S>(name: impl Into<String>, columns: I, primary_key: &[&str]) -> Self
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(|(c, t)| (c.into(), t)).collect(),
            primary_key: primary_key.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Infers a spec from a sample row. Used when the replica catalog has no
    /// declared spec for a table seen on the replication stream.
    #[must_use]
    pub fn infer(name: &str, row: &Row, primary_key: Vec<String>) -> Self {
        let columns = row
            .iter()
            .map(|(c, v)| {
                let t = match v {
                    Value::Null => ColumnType::Null,
                    Value::Bool(_) => ColumnType::Boolean,
                    Value::Int(_) | Value::Float(_) => ColumnType::Number,
                    Value::String(_) => ColumnType::String,
                    Value::Array(_) | Value::Map(_) => ColumnType::Json,
                };
                (c.clone(), t)
            })
            .collect();
        Self {
            name: name.to_string(),
            columns,
            primary_key,
        }
    }
}

/// Appends any primary-key column missing from `order` (ascending), so the
/// resulting ordering is total over distinct rows.
#[must_use]
pub fn with_primary_key(order: &[OrderPart], primary_key: &[String]) -> OrderBy {
    let mut full: OrderBy = order.to_vec();
    for column in primary_key {
        if !full.iter().any(|(c, _)| c == column) {
            full.push((column.clone(), Direction::Asc));
        }
    }
    full
}

/// Compares two rows under `order`. Missing columns read as `null`.
#[must_use]
pub fn compare_rows(order: &[OrderPart], a: &Row, b: &Row) -> Ordering {
    static NULL: Value = Value::Null;
    for (column, direction) in order {
        let left = a.get(column).unwrap_or(&NULL);
        let right = b.get(column).unwrap_or(&NULL);
        let ord = compare_values(left, right);
        let ord = match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Output schema of an operator.
///
/// `sort` always ends with the primary key, so `compare_rows` is a total
/// order over rows of the table. `is_hidden` marks junction levels that views
/// flatten into their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSchema {
    pub table_name: String,
    pub columns: BTreeMap<String, ColumnType>,
    pub primary_key: Vec<String>,
    pub sort: OrderBy,
    pub relationships: BTreeMap<String, SourceSchema>,
    pub is_hidden: bool,
}

impl SourceSchema {
    /// Schema for a direct source connection sorted by `sort`.
    #[must_use]
    pub fn for_table(spec: &TableSpec, sort: &[OrderPart]) -> Self {
        Self {
            table_name: spec.name.clone(),
            columns: spec.columns.clone(),
            primary_key: spec.primary_key.clone(),
            sort: with_primary_key(sort, &spec.primary_key),
            relationships: BTreeMap::new(),
            is_hidden: false,
        }
    }

    #[must_use]
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        compare_rows(&self.sort, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::make_row;

    #[test]
    fn primary_key_appended_once() {
        let order = vec![("modified".to_string(), Direction::Desc)];
        let full = with_primary_key(&order, &["id".to_string()]);
        assert_eq!(
            full,
            vec![
                ("modified".to_string(), Direction::Desc),
                ("id".to_string(), Direction::Asc)
            ]
        );
        let again = with_primary_key(&full, &["id".to_string()]);
        assert_eq!(again, full);
    }

    #[test]
    fn descending_columns_reverse_comparison() {
        let order = vec![
            ("modified".to_string(), Direction::Desc),
            ("id".to_string(), Direction::Asc),
        ];
        let a = make_row([("id", 1), ("modified", 10)]);
        let b = make_row([("id", 2), ("modified", 20)]);
        assert_eq!(compare_rows(&order, &a, &b), Ordering::Greater);

        let c = make_row([("id", 3), ("modified", 10)]);
        assert_eq!(compare_rows(&order, &a, &c), Ordering::Less);
    }

    #[test]
    fn infer_spec_from_row() {
        let row = make_row([
            ("id", Value::from("a")),
            ("n", Value::from(1)),
            ("flag", Value::from(true)),
        ]);
        let spec = TableSpec::infer("t", &row, vec!["id".into()]);
        assert_eq!(spec.columns["id"], ColumnType::String);
        assert_eq!(spec.columns["n"], ColumnType::Number);
        assert_eq!(spec.columns["flag"], ColumnType::Boolean);
    }
}
