//! Take: limit, optionally counted per partition.
//!
//! Take passes through the first `limit` nodes of its input in the input's
//! sort order and remembers the last accepted row as the *bound*. Pushes are
//! judged against the bound. When a row inside the window leaves, the
//! replacement is found by fetching just past the old bound, never by
//! refetching the window.
//!
//! With a partition key (a limit on a relationship), the window is kept per
//! partition value and `max_bound` tracks the largest bound of any partition,
//! so unpartitioned fetches can stop early.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::change::Change;
use crate::data::{row_key, Constraint, Node, Row, RowKey};
use crate::error::IvmError;
use crate::ivm::operator::{Basis, BoxedOperator, FetchRequest, Operator, SourcePush};
use crate::schema::{compare_rows, OrderBy, SourceSchema};
use crate::stream::{self, Stream};
use crate::types::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TakeState {
    size: usize,
    bound: Option<Row>,
}

#[derive(Debug, Default)]
struct TakeStore {
    states: BTreeMap<RowKey, TakeState>,
    max_bound: Option<Row>,
}

/// Limit operator.
pub struct Take {
    input: BoxedOperator,
    limit: usize,
    partition_key: Option<Vec<String>>,
    store: Mutex<TakeStore>,
}

impl Take {
    #[must_use]
    pub fn new(input: BoxedOperator, limit: usize, partition_key: Option<Vec<String>>) -> Self {
        Self {
            input,
            limit,
            partition_key,
            store: Mutex::new(TakeStore::default()),
        }
    }

    fn sort(&self) -> &OrderBy {
        &self.input.schema().sort
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        compare_rows(self.sort(), a, b)
    }

    /// State key for a row or constraint: its partition values, or the single
    /// global window when there is no partition key.
    fn state_key(&self, row: &Row) -> RowKey {
        match &self.partition_key {
            Some(pk) => row_key(row, pk),
            None => RowKey::new(),
        }
    }

    fn partition_constraint(&self, row: &Row) -> Option<Constraint> {
        self.partition_key.as_ref().map(|pk| {
            pk.iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
    }

    fn constraint_matches_partition(&self, constraint: Option<&Constraint>) -> bool {
        match (constraint, &self.partition_key) {
            (None, None) => true,
            (Some(c), Some(pk)) => c.len() == pk.len() && pk.iter().all(|k| c.contains_key(k)),
            _ => false,
        }
    }

    fn set_state(&self, store: &mut TakeStore, key: RowKey, size: usize, bound: Option<Row>) {
        if let Some(b) = &bound {
            let raise = store
                .max_bound
                .as_ref()
                .map_or(true, |max| self.compare(b, max) == Ordering::Greater);
            if raise {
                store.max_bound = Some(b.clone());
            }
        }
        store.states.insert(key, TakeState { size, bound });
    }

    /// Collects the first `limit` rows of a partition and records its state.
    fn hydrate(&self, key: RowKey, constraint: Option<&Constraint>) -> Vec<Node> {
        let req = FetchRequest {
            constraint: constraint.cloned(),
            ..FetchRequest::default()
        };
        let nodes = if self.limit == 0 {
            Vec::new()
        } else {
            stream::take(self.input.fetch(&req), self.limit)
        };
        let bound = nodes.last().map(|n| n.row.clone());
        let mut store = self.store.lock();
        self.set_state(&mut store, key, nodes.len(), bound);
        nodes
    }

    fn fetch_bounded<'a>(&'a self, req: &FetchRequest, bound: Row) -> Stream<'a> {
        let sort = self.sort().clone();
        if req.reverse {
            Box::new(
                self.input
                    .fetch(req)
                    .skip_while(move |n| compare_rows(&sort, &n.row, &bound) == Ordering::Greater),
            )
        } else {
            Box::new(
                self.input
                    .fetch(req)
                    .take_while(move |n| compare_rows(&sort, &bound, &n.row) != Ordering::Less),
            )
        }
    }

    fn fetch_at(&self, bound: &Row, basis: Basis, constraint: Option<&Constraint>, reverse: bool) -> Stream<'_> {
        let mut req = FetchRequest {
            constraint: constraint.cloned(),
            ..FetchRequest::default()
        }
        .starting(bound.clone(), basis);
        req.reverse = reverse;
        self.input.fetch(&req)
    }

    fn missing(detail: &str) -> IvmError {
        IvmError::invariant("take", detail)
    }

    fn apply(&self, change: Change, out: &mut Vec<Change>) -> Result<(), IvmError> {
        if let Change::Edit { old, new } = change {
            return self.apply_edit(old, new, out);
        }

        let row = change.row().clone();
        let key = self.state_key(&row);
        let Some(state) = self.store.lock().states.get(&key).cloned() else {
            return Ok(());
        };
        let constraint = self.partition_constraint(&row);

        match change {
            Change::Add(node) => {
                if state.size < self.limit {
                    let bound = match &state.bound {
                        Some(b) if self.compare(b, &node.row) != Ordering::Less => b.clone(),
                        _ => node.row.clone(),
                    };
                    self.set_state(&mut self.store.lock(), key, state.size + 1, Some(bound));
                    out.push(Change::Add(node));
                    return Ok(());
                }
                let Some(bound) = state.bound else {
                    return Ok(());
                };
                if self.compare(&node.row, &bound) != Ordering::Less {
                    return Ok(());
                }
                // The added row displaces the current bound.
                let (bound_node, before_bound) = if self.limit == 1 {
                    let first = stream::first(self.fetch_at(&bound, Basis::At, constraint.as_ref(), false));
                    (first, None)
                } else {
                    let mut two = stream::take(
                        self.fetch_at(&bound, Basis::At, constraint.as_ref(), true),
                        2,
                    )
                    .into_iter();
                    (two.next(), two.next())
                };
                let bound_node = bound_node.ok_or_else(|| Self::missing("bound row missing on add"))?;
                let new_bound = match before_bound {
                    Some(b) if self.compare(&node.row, &b.row) != Ordering::Greater => b.row,
                    _ => node.row.clone(),
                };
                self.set_state(&mut self.store.lock(), key, state.size, Some(new_bound));
                out.push(Change::Remove(bound_node));
                out.push(Change::Add(node));
            }
            Change::Remove(node) => {
                let Some(bound) = state.bound else {
                    return Ok(());
                };
                if self.compare(&node.row, &bound) == Ordering::Greater {
                    return Ok(());
                }
                let before_bound =
                    stream::first(self.fetch_at(&bound, Basis::After, constraint.as_ref(), true));

                let mut new_bound = before_bound.map(|n| {
                    let push = self.compare(&n.row, &bound) == Ordering::Greater;
                    (n, push)
                });
                if !new_bound.as_ref().is_some_and(|(_, push)| *push) {
                    for n in self.fetch_at(&bound, Basis::At, constraint.as_ref(), false) {
                        let push = self.compare(&n.row, &bound) == Ordering::Greater;
                        new_bound = Some((n, push));
                        if push {
                            break;
                        }
                    }
                }

                match new_bound {
                    Some((replacement, true)) => {
                        self.set_state(&mut self.store.lock(), key, state.size, Some(replacement.row.clone()));
                        out.push(Change::Remove(node));
                        out.push(Change::Add(replacement));
                    }
                    other => {
                        let bound = other.map(|(n, _)| n.row);
                        self.set_state(&mut self.store.lock(), key, state.size.saturating_sub(1), bound);
                        out.push(Change::Remove(node));
                    }
                }
            }
            Change::Child { .. } => {
                if state
                    .bound
                    .as_ref()
                    .is_some_and(|b| self.compare(&row, b) != Ordering::Greater)
                {
                    out.push(change);
                }
            }
            Change::Edit { .. } => {}
        }
        Ok(())
    }

    fn apply_edit(&self, old: Node, new: Node, out: &mut Vec<Change>) -> Result<(), IvmError> {
        if let Some(pk) = &self.partition_key {
            if row_key(&old.row, pk) != row_key(&new.row, pk) {
                self.apply(Change::Remove(old), out)?;
                return self.apply(Change::Add(new), out);
            }
        }

        let key = self.state_key(&old.row);
        let Some(state) = self.store.lock().states.get(&key).cloned() else {
            return Ok(());
        };
        // An empty window stays empty: the edited row was never inside it.
        let Some(bound) = state.bound else {
            return Ok(());
        };
        let constraint = self.partition_constraint(&old.row);
        let old_cmp = self.compare(&old.row, &bound);
        let new_cmp = self.compare(&new.row, &bound);

        match old_cmp {
            // The bound row itself changed.
            Ordering::Equal => match new_cmp {
                Ordering::Equal => out.push(Change::Edit { old, new }),
                Ordering::Less => {
                    if self.limit == 1 {
                        self.set_state(&mut self.store.lock(), key, state.size, Some(new.row.clone()));
                    } else {
                        let before = stream::first(self.fetch_at(&bound, Basis::After, constraint.as_ref(), true))
                            .ok_or_else(|| Self::missing("no row before bound"))?;
                        self.set_state(&mut self.store.lock(), key, state.size, Some(before.row));
                    }
                    out.push(Change::Edit { old, new });
                }
                Ordering::Greater => {
                    let next = stream::first(self.fetch_at(&bound, Basis::At, constraint.as_ref(), false))
                        .ok_or_else(|| Self::missing("no row at bound"))?;
                    if self.compare(&next.row, &new.row) == Ordering::Equal {
                        self.set_state(&mut self.store.lock(), key, state.size, Some(new.row.clone()));
                        out.push(Change::Edit { old, new });
                    } else {
                        self.set_state(&mut self.store.lock(), key, state.size, Some(next.row.clone()));
                        out.push(Change::Remove(old));
                        out.push(Change::Add(next));
                    }
                }
            },
            Ordering::Greater => {
                if new_cmp == Ordering::Equal {
                    return Err(Self::missing("edited row collides with bound"));
                }
                if new_cmp == Ordering::Greater {
                    return Ok(());
                }
                // Old was outside, new is inside: the bound is pushed out.
                let mut two = stream::take(
                    self.fetch_at(&bound, Basis::At, constraint.as_ref(), true),
                    2,
                )
                .into_iter();
                let old_bound = two.next().ok_or_else(|| Self::missing("bound row missing on edit"))?;
                let new_bound = two.next().ok_or_else(|| Self::missing("no row before bound"))?;
                self.set_state(&mut self.store.lock(), key, state.size, Some(new_bound.row));
                out.push(Change::Remove(old_bound));
                out.push(Change::Add(new));
            }
            Ordering::Less => {
                if new_cmp == Ordering::Equal {
                    return Err(Self::missing("edited row collides with bound"));
                }
                if new_cmp == Ordering::Less {
                    out.push(Change::Edit { old, new });
                    return Ok(());
                }
                // Old was inside, new moved past the bound.
                let after = stream::first(self.fetch_at(&bound, Basis::After, constraint.as_ref(), false))
                    .ok_or_else(|| Self::missing("no row after bound"))?;
                if self.compare(&after.row, &new.row) == Ordering::Equal {
                    self.set_state(&mut self.store.lock(), key, state.size, Some(new.row.clone()));
                    out.push(Change::Edit { old, new });
                } else {
                    self.set_state(&mut self.store.lock(), key, state.size, Some(after.row.clone()));
                    out.push(Change::Remove(old));
                    out.push(Change::Add(after));
                }
            }
        }
        Ok(())
    }
}

impl Operator for Take {
    fn schema(&self) -> &SourceSchema {
        self.input.schema()
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        if self.constraint_matches_partition(req.constraint.as_ref()) {
            let key = req
                .constraint
                .as_ref()
                .map_or_else(RowKey::new, |c| self.state_key(c));
            let state = self.store.lock().states.get(&key).cloned();
            let state = match state {
                Some(state) => state,
                None => {
                    let nodes = self.hydrate(key.clone(), req.constraint.as_ref());
                    if req.start.is_none() && !req.reverse {
                        return Box::new(nodes.into_iter());
                    }
                    self.store.lock().states.get(&key).cloned().unwrap_or_default()
                }
            };
            return match state.bound {
                Some(bound) => self.fetch_bounded(req, bound),
                None => stream::empty(),
            };
        }

        // Constrained on something other than the partition key: every
        // partition's window applies.
        let Some(max_bound) = self.store.lock().max_bound.clone() else {
            return stream::empty();
        };
        let sort = self.sort().clone();
        Box::new(
            self.input
                .fetch(req)
                .take_while({
                    let sort = sort.clone();
                    move |n| compare_rows(&sort, &n.row, &max_bound) != Ordering::Greater
                })
                .filter(move |n| {
                    let key = self.state_key(&n.row);
                    self.store
                        .lock()
                        .states
                        .get(&key)
                        .and_then(|s| s.bound.as_ref())
                        .is_some_and(|b| compare_rows(&sort, b, &n.row) != Ordering::Less)
                }),
        )
    }

    fn cleanup(&self, req: &FetchRequest) -> Stream<'_> {
        let key = req
            .constraint
            .as_ref()
            .map_or_else(RowKey::new, |c| self.state_key(c));
        self.store.lock().states.remove(&key);
        Box::new(self.input.cleanup(req).take(self.limit))
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        let mut out = Vec::new();
        for change in self.input.push(push)? {
            self.apply(change, &mut out)?;
        }
        Ok(out)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use proptest::prelude::*;

    use super::*;
    use crate::change::SourceChange;
    use crate::data::make_row;
    use crate::ivm::source::{constraint_on, ChangeSink, MemorySource, Source};
    use crate::schema::{ColumnType, Direction, TableSpec};

    fn spec() -> TableSpec {
        TableSpec::new(
            "t",
            [
                ("id", ColumnType::Number),
                ("g", ColumnType::String),
                ("v", ColumnType::Number),
            ],
            &["id"],
        )
    }

    fn row(id: i64, g: &str, v: i64) -> Row {
        make_row([
            ("id", Value::from(id)),
            ("g", Value::from(g)),
            ("v", Value::from(v)),
        ])
    }

    /// Holds a Take and records every change it emits.
    struct Harness {
        take: Mutex<Take>,
        emitted: Mutex<Vec<Change>>,
        errors: Mutex<Vec<IvmError>>,
    }

    impl ChangeSink for Harness {
        fn push(&self, push: &SourcePush) {
            match self.take.lock().push(push) {
                Ok(changes) => self.emitted.lock().extend(changes),
                Err(e) => self.errors.lock().push(e),
            }
        }
    }

    fn harness(source: &MemorySource, limit: usize, partition: Option<Vec<String>>) -> Arc<Harness> {
        let (conn, input) = source.connect(&[("v".to_string(), Direction::Asc)]);
        let h = Arc::new(Harness {
            take: Mutex::new(Take::new(input, limit, partition)),
            emitted: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        });
        let sink: Arc<dyn ChangeSink> = h.clone();
        let weak: Weak<dyn ChangeSink> = Arc::downgrade(&sink);
        source.subscribe(conn, weak);
        h
    }

    fn ids(nodes: impl IntoIterator<Item = Node>) -> Vec<i64> {
        nodes
            .into_iter()
            .map(|n| n.row["id"].as_i64().unwrap())
            .collect()
    }

    fn window(h: &Harness) -> Vec<i64> {
        ids(h.take.lock().fetch(&FetchRequest::default()).collect::<Vec<_>>())
    }

    fn summary(changes: &[Change]) -> Vec<(&'static str, i64)> {
        changes
            .iter()
            .map(|c| (c.kind(), c.row()["id"].as_i64().unwrap()))
            .collect()
    }

    #[test]
    fn hydrates_first_rows_and_backfills_on_remove() {
        let source = MemorySource::new(spec());
        source.load((1..=5).map(|i| row(i, "a", i * 10)));
        let h = harness(&source, 3, None);
        assert_eq!(window(&h), vec![1, 2, 3]);

        source.push(SourceChange::Remove(row(2, "a", 20)));
        source.commit().unwrap();
        assert_eq!(summary(&h.emitted.lock()), vec![("remove", 2), ("add", 4)]);
        assert_eq!(window(&h), vec![1, 3, 4]);
    }

    #[test]
    fn add_below_bound_evicts_bound() {
        let source = MemorySource::new(spec());
        source.load((1..=4).map(|i| row(i, "a", i * 10)));
        let h = harness(&source, 2, None);
        assert_eq!(window(&h), vec![1, 2]);

        source.push(SourceChange::Add(row(9, "a", 5)));
        source.commit().unwrap();
        assert_eq!(summary(&h.emitted.lock()), vec![("remove", 2), ("add", 9)]);
        assert_eq!(window(&h), vec![9, 1]);
    }

    #[test]
    fn add_past_bound_is_dropped_when_full() {
        let source = MemorySource::new(spec());
        source.load((1..=3).map(|i| row(i, "a", i * 10)));
        let h = harness(&source, 2, None);
        let _ = window(&h);
        source.push(SourceChange::Add(row(7, "a", 99)));
        source.commit().unwrap();
        assert!(h.emitted.lock().is_empty());
    }

    #[test]
    fn edit_moving_row_out_of_window_pulls_next() {
        let source = MemorySource::new(spec());
        source.load((1..=4).map(|i| row(i, "a", i * 10)));
        let h = harness(&source, 2, None);
        let _ = window(&h);

        source.push(SourceChange::Edit {
            old: row(1, "a", 10),
            new: row(1, "a", 100),
        });
        source.commit().unwrap();
        assert_eq!(summary(&h.emitted.lock()), vec![("remove", 1), ("add", 3)]);
        assert_eq!(window(&h), vec![2, 3]);
    }

    #[test]
    fn edit_within_window_is_forwarded() {
        let source = MemorySource::new(spec());
        source.load((1..=4).map(|i| row(i, "a", i * 10)));
        let h = harness(&source, 3, None);
        let _ = window(&h);
        source.push(SourceChange::Edit {
            old: row(1, "a", 10),
            new: row(1, "a", 15),
        });
        source.commit().unwrap();
        assert_eq!(summary(&h.emitted.lock()), vec![("edit", 1)]);
    }

    #[test]
    fn partitions_are_limited_independently() {
        let source = MemorySource::new(spec());
        source.load([
            row(1, "a", 1),
            row(2, "a", 2),
            row(3, "a", 3),
            row(4, "b", 4),
            row(5, "b", 5),
        ]);
        let h = harness(&source, 1, Some(vec!["g".to_string()]));
        let take = h.take.lock();
        let a = ids(take.fetch(&FetchRequest::constrained(constraint_on("g", "a"))).collect::<Vec<_>>());
        let b = ids(take.fetch(&FetchRequest::constrained(constraint_on("g", "b"))).collect::<Vec<_>>());
        assert_eq!(a, vec![1]);
        assert_eq!(b, vec![4]);

        // Unpartitioned fetch sees every partition's window.
        assert_eq!(ids(take.fetch(&FetchRequest::default()).collect::<Vec<_>>()), vec![1, 4]);

        let cleaned = ids(take.cleanup(&FetchRequest::constrained(constraint_on("g", "a"))).collect::<Vec<_>>());
        assert_eq!(cleaned, vec![1]);
        assert_eq!(ids(take.fetch(&FetchRequest::default()).collect::<Vec<_>>()), vec![4]);
    }

    #[test]
    fn zero_limit_emits_nothing() {
        let source = MemorySource::new(spec());
        source.load([row(1, "a", 1)]);
        let h = harness(&source, 0, None);
        assert!(window(&h).is_empty());
        source.push(SourceChange::Add(row(2, "a", 0)));
        source.commit().unwrap();
        assert!(h.emitted.lock().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(i64, i64),
        Remove(usize),
        Edit(usize, i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..50, 0i64..20).prop_map(|(id, v)| Op::Add(id, v)),
            (0usize..64).prop_map(Op::Remove),
            (0usize..64, 0i64..20).prop_map(|(i, v)| Op::Edit(i, v)),
        ]
    }

    proptest! {
        #[test]
        fn window_matches_smallest_rows(
            initial in proptest::collection::btree_map(0i64..50, 0i64..20, 0..12),
            ops in proptest::collection::vec(op(), 0..40),
            limit in 0usize..5,
        ) {
            let source = MemorySource::new(spec());
            source.load(initial.iter().map(|(id, v)| row(*id, "a", *v)));
            let h = harness(&source, limit, None);
            let _ = window(&h);

            for op in ops {
                let live = source.rows();
                let change = match op {
                    Op::Add(id, v) => Some(SourceChange::Add(row(id, "a", v))),
                    Op::Remove(i) if !live.is_empty() => Some(SourceChange::Remove(live[i % live.len()].clone())),
                    Op::Edit(i, v) if !live.is_empty() => {
                        let old = live[i % live.len()].clone();
                        let mut new = old.clone();
                        new.insert("v".into(), Value::from(v));
                        Some(SourceChange::Edit { old, new })
                    }
                    _ => None,
                };
                if let Some(change) = change {
                    source.push(change);
                    source.commit().unwrap();
                }
                prop_assert!(h.errors.lock().is_empty());

                let mut expected = source.rows();
                let sort = vec![("v".to_string(), Direction::Asc), ("id".to_string(), Direction::Asc)];
                expected.sort_by(|a, b| compare_rows(&sort, a, b));
                let expected: Vec<i64> = expected
                    .iter()
                    .take(limit)
                    .map(|r| r["id"].as_i64().unwrap())
                    .collect();
                prop_assert_eq!(window(&h), expected);
            }
        }
    }
}
