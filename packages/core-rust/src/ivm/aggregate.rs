//! Aggregate: `GROUP BY` with running `count`/`sum`/`avg`/`min`/`max`.
//!
//! Each input change is turned into signed contributions (`+1` for the new
//! row, `-1` for the old one) that update the affected groups in place. A
//! group emits only when its visible row actually changes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::ast::{AggregateFn, Aggregation};
use crate::change::Change;
use crate::data::{constraint_matches, row_key, Node, Row, RowKey};
use crate::error::IvmError;
use crate::ivm::operator::{Basis, BoxedOperator, FetchRequest, Operator, SourcePush};
use crate::multiset::{change_entries, Entry};
use crate::schema::{compare_rows, ColumnType, Direction, SourceSchema};
use crate::stream::Stream;
use crate::types::Value;

/// Running state of one aggregation within one group.
#[derive(Debug, Clone, Default)]
struct Accumulator {
    non_null: i64,
    int_sum: i64,
    float_sum: f64,
    floats: i64,
    /// Multiset of values, kept for `min`/`max` so removals are exact.
    values: BTreeMap<Value, i64>,
}

impl Accumulator {
    fn apply(&mut self, value: &Value, multiplicity: i64, keep_values: bool) {
        if value.is_null() {
            return;
        }
        self.non_null += multiplicity;
        match value {
            Value::Int(i) => self.int_sum = self.int_sum.wrapping_add(i.wrapping_mul(multiplicity)),
            Value::Float(f) => {
                #[allow(clippy::cast_precision_loss)]
                let weighted = f * multiplicity as f64;
                self.float_sum += weighted;
                self.floats += multiplicity;
            }
            _ => {}
        }
        if keep_values {
            let count = self.values.entry(value.clone()).or_insert(0);
            *count += multiplicity;
            if *count <= 0 {
                self.values.remove(value);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn total(&self) -> f64 {
        self.int_sum as f64 + self.float_sum
    }

    fn output(&self, func: AggregateFn, rows: i64, counts_rows: bool) -> Value {
        match func {
            AggregateFn::Count if counts_rows => Value::Int(rows),
            AggregateFn::Count => Value::Int(self.non_null),
            AggregateFn::Sum if self.non_null == 0 => Value::Null,
            AggregateFn::Sum if self.floats == 0 => Value::Int(self.int_sum),
            AggregateFn::Sum => Value::Float(self.total()),
            AggregateFn::Avg if self.non_null == 0 => Value::Null,
            #[allow(clippy::cast_precision_loss)]
            AggregateFn::Avg => Value::Float(self.total() / self.non_null as f64),
            AggregateFn::Min => self.values.keys().next().cloned().unwrap_or(Value::Null),
            AggregateFn::Max => self.values.keys().next_back().cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Group {
    rows: i64,
    accumulators: Vec<Accumulator>,
}

#[derive(Debug, Default)]
struct AggregateState {
    hydrated: bool,
    groups: BTreeMap<RowKey, Group>,
}

pub struct Aggregate {
    input: BoxedOperator,
    group_by: Vec<String>,
    aggregations: Vec<Aggregation>,
    schema: SourceSchema,
    state: Mutex<AggregateState>,
}

impl Aggregate {
    /// # Errors
    ///
    /// Returns [`IvmError::UnknownColumn`] for a group or aggregate column the
    /// input does not have, and [`IvmError::InvalidQuery`] for a non-count
    /// aggregate without a field.
    pub fn new(
        input: BoxedOperator,
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    ) -> Result<Self, IvmError> {
        let input_schema = input.schema();
        for column in group_by
            .iter()
            .chain(aggregations.iter().filter_map(|a| a.field.as_ref()))
        {
            if !input_schema.columns.contains_key(column) {
                return Err(IvmError::UnknownColumn {
                    table: input_schema.table_name.clone(),
                    column: column.clone(),
                });
            }
        }
        if let Some(bad) = aggregations
            .iter()
            .find(|a| a.field.is_none() && a.aggregate != AggregateFn::Count)
        {
            return Err(IvmError::InvalidQuery(format!(
                "aggregate {} needs a field",
                bad.alias
            )));
        }

        let mut columns: BTreeMap<String, ColumnType> = group_by
            .iter()
            .map(|c| (c.clone(), input_schema.columns[c]))
            .collect();
        for a in &aggregations {
            let t = match a.aggregate {
                AggregateFn::Count | AggregateFn::Sum | AggregateFn::Avg => ColumnType::Number,
                AggregateFn::Min | AggregateFn::Max => a
                    .field
                    .as_ref()
                    .map_or(ColumnType::Json, |f| input_schema.columns[f]),
            };
            columns.insert(a.alias.clone(), t);
        }
        let schema = SourceSchema {
            table_name: input_schema.table_name.clone(),
            columns,
            primary_key: group_by.clone(),
            sort: group_by.iter().map(|c| (c.clone(), Direction::Asc)).collect(),
            relationships: BTreeMap::new(),
            is_hidden: false,
        };
        Ok(Self {
            input,
            group_by,
            aggregations,
            schema,
            state: Mutex::new(AggregateState::default()),
        })
    }

    fn keeps_values(func: AggregateFn) -> bool {
        matches!(func, AggregateFn::Min | AggregateFn::Max)
    }

    fn contribute(&self, state: &mut AggregateState, row: &Row, multiplicity: i64) {
        let key = row_key(row, &self.group_by);
        let group = state.groups.entry(key).or_insert_with(|| Group {
            rows: 0,
            accumulators: vec![Accumulator::default(); self.aggregations.len()],
        });
        group.rows += multiplicity;
        for (acc, agg) in group.accumulators.iter_mut().zip(&self.aggregations) {
            if let Some(field) = &agg.field {
                if let Some(value) = row.get(field) {
                    acc.apply(value, multiplicity, Self::keeps_values(agg.aggregate));
                }
            }
        }
    }

    /// The visible row for a group, or `None` when the group is empty. Without
    /// `group_by` the single group is always visible.
    fn group_row(&self, key: &RowKey, group: Option<&Group>) -> Option<Row> {
        let rows = group.map_or(0, |g| g.rows);
        if rows <= 0 && !self.group_by.is_empty() {
            return None;
        }
        let mut row: Row = self
            .group_by
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect();
        for (i, agg) in self.aggregations.iter().enumerate() {
            let value = match group.and_then(|g| g.accumulators.get(i)) {
                Some(acc) => acc.output(agg.aggregate, rows, agg.field.is_none()),
                None => Accumulator::default().output(agg.aggregate, 0, agg.field.is_none()),
            };
            row.insert(agg.alias.clone(), value);
        }
        Some(row)
    }

    fn hydrate(&self) {
        if self.state.lock().hydrated {
            return;
        }
        let rows: Vec<Row> = self
            .input
            .fetch(&FetchRequest::default())
            .map(|n| n.row)
            .collect();
        let mut state = self.state.lock();
        for row in &rows {
            self.contribute(&mut state, row, 1);
        }
        state.hydrated = true;
        trace!(groups = state.groups.len(), "aggregate hydrated");
    }

    fn all_rows(&self) -> Vec<Row> {
        let state = self.state.lock();
        if self.group_by.is_empty() {
            return self
                .group_row(&RowKey::new(), state.groups.get(&RowKey::new()))
                .into_iter()
                .collect();
        }
        state
            .groups
            .iter()
            .filter_map(|(key, group)| self.group_row(key, Some(group)))
            .collect()
    }
}

impl Operator for Aggregate {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        self.hydrate();
        let sort = &self.schema.sort;
        let mut rows: Vec<Row> = self
            .all_rows()
            .into_iter()
            .filter(|r| req.constraint.as_ref().map_or(true, |c| constraint_matches(r, c)))
            .filter(|r| match &req.start {
                None => true,
                Some(start) => {
                    let ord = compare_rows(sort, r, &start.row);
                    let ord = if req.reverse { ord.reverse() } else { ord };
                    match start.basis {
                        Basis::At => ord != Ordering::Less,
                        Basis::After => ord == Ordering::Greater,
                    }
                }
            })
            .collect();
        if req.reverse {
            rows.reverse();
        }
        Box::new(rows.into_iter().map(Node::new))
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        let changes = self.input.push(push)?;
        let mut state = self.state.lock();
        if !state.hydrated {
            return Ok(Vec::new());
        }

        let entries: Vec<Entry<Node>> = changes.iter().flat_map(change_entries).collect();
        let touched: BTreeSet<RowKey> = entries
            .iter()
            .map(|e| row_key(&e.value.row, &self.group_by))
            .collect();
        let before: Vec<(RowKey, Option<Row>)> = touched
            .iter()
            .map(|k| (k.clone(), self.group_row(k, state.groups.get(k))))
            .collect();

        for entry in &entries {
            self.contribute(&mut state, &entry.value.row, entry.multiplicity);
        }

        let mut out = Vec::new();
        for (key, old) in before {
            let new = self.group_row(&key, state.groups.get(&key));
            if state.groups.get(&key).is_some_and(|g| g.rows <= 0) {
                state.groups.remove(&key);
            }
            match (old, new) {
                (None, Some(row)) => out.push(Change::Add(Node::new(row))),
                (Some(row), None) => out.push(Change::Remove(Node::new(row))),
                (Some(old), Some(new)) if old != new => out.push(Change::Edit {
                    old: Node::new(old),
                    new: Node::new(new),
                }),
                _ => {}
            }
        }
        Ok(out)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}
