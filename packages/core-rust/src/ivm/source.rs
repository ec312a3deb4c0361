//! Sources: ordered tables that feed operator graphs.
//!
//! A source keeps its rows in sorted indexes (one per `(constraint columns,
//! ordering)` combination, created lazily on first use). Changes are buffered
//! by [`Source::push`] and delivered at [`Source::commit`], so no consumer
//! observes part of a transaction.
//!
//! # Overlay
//!
//! A committed change is delivered to connections one at a time, in
//! connection order, and only applied to the indexes after every connection has
//! seen it. While connection `k` is processing the change, a fetch through
//! connection `c` observes the change iff `c <= k`: those connections have
//! already received it (or are receiving it), later ones have not.
//!
//! # Duplicate keys
//!
//! An `Add` for a primary key that is already present is treated as an
//! implicit edit and delivered as a single `Edit { old, new }`. Re-adding an
//! identical row is a no-op, which makes replayed deliveries harmless.
//! `Remove` and `Edit` of a missing key are consistency errors.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::change::{Change, SourceChange};
use crate::data::{constraint_matches, display_key, row_key, Constraint, Node, Row, RowKey};
use crate::error::IvmError;
use crate::ivm::operator::{
    Basis, BoxedOperator, ConnectionId, FetchRequest, Operator, SourcePush,
};
use crate::schema::{Direction, OrderBy, OrderPart, SourceSchema, TableSpec};
use crate::stream::Stream;
use crate::types::{compare_values, Value};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receives source pushes for the connections it subscribed to.
///
/// Sinks are usually the owner of a whole pipeline (a view, or a pipeline in
/// the driver). They route the push into their root operator and keep the
/// resulting changes.
pub trait ChangeSink: Send + Sync {
    /// Called once per delivered change for each subscribed connection.
    fn push(&self, push: &SourcePush);

    /// Called once after a commit finished delivering all of its changes.
    fn commit(&self) {}
}

/// The source contract shared by memory- and store-backed tables.
pub trait Source: Send + Sync {
    /// Table this source serves.
    fn spec(&self) -> &TableSpec;

    /// Opens a connection sorted by `sort` (primary key appended) and returns
    /// the input operator bound to it.
    fn connect(&self, sort: &[OrderPart]) -> (ConnectionId, BoxedOperator);

    /// Registers `sink` to receive pushes for `connection`. Dead sinks are
    /// pruned on the next delivery.
    fn subscribe(&self, connection: ConnectionId, sink: Weak<dyn ChangeSink>);

    /// Buffers a change for delivery at the next commit.
    fn push(&self, change: SourceChange);

    /// Delivers every buffered change, in order, and returns how many
    /// concrete changes were delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if a change is inconsistent with the source's data.
    /// The replica is then out of sync with this source and the caller must
    /// rebuild it.
    fn commit(&self) -> Result<usize, IvmError>;
}

// ---------------------------------------------------------------------------
// Sort keys
// ---------------------------------------------------------------------------

/// One element of an index key. `Min`/`Max` are bounds that sort before/after
/// every value, used to scan a constraint prefix.
#[derive(Debug, Clone)]
enum KeyPart {
    Min,
    Val(Value, Direction),
    Max,
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self, other) {
            (KeyPart::Min, KeyPart::Min) | (KeyPart::Max, KeyPart::Max) => CmpOrdering::Equal,
            (KeyPart::Min, _) | (_, KeyPart::Max) => CmpOrdering::Less,
            (_, KeyPart::Min) | (KeyPart::Max, _) => CmpOrdering::Greater,
            (KeyPart::Val(a, dir), KeyPart::Val(b, _)) => {
                let ord = compare_values(a, b);
                match dir {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            }
        }
    }
}

type SortKey = Vec<KeyPart>;

fn sort_key(row: &Row, spec: &[OrderPart]) -> SortKey {
    spec.iter()
        .map(|(column, dir)| KeyPart::Val(row.get(column).cloned().unwrap_or(Value::Null), *dir))
        .collect()
}

fn within(key: &SortKey, lower: &Bound<SortKey>, upper: &Bound<SortKey>) -> bool {
    let above = match lower {
        Bound::Included(l) => key >= l,
        Bound::Excluded(l) => key > l,
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(u) => key <= u,
        Bound::Excluded(u) => key < u,
        Bound::Unbounded => true,
    };
    above && below
}

/// `BTreeMap::range` panics on inverted bounds, so check first.
fn range_is_empty(lower: &Bound<SortKey>, upper: &Bound<SortKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Index {
    rows: BTreeMap<SortKey, Row>,
    used_by: BTreeSet<u32>,
}

struct ConnectionState {
    sort: OrderBy,
    sinks: Vec<Weak<dyn ChangeSink>>,
}

struct Overlay {
    connection: u32,
    change: SourceChange,
}

struct SourceState {
    indexes: BTreeMap<OrderBy, Index>,
    connections: BTreeMap<u32, ConnectionState>,
    next_connection: u32,
    overlay: Option<Overlay>,
    pending: Vec<SourceChange>,
    seq: u64,
}

impl SourceState {
    fn apply(&mut self, change: &SourceChange) {
        for (spec, index) in &mut self.indexes {
            match change {
                SourceChange::Add(row) => {
                    index.rows.insert(sort_key(row, spec), row.clone());
                }
                SourceChange::Remove(row) => {
                    index.rows.remove(&sort_key(row, spec));
                }
                SourceChange::Edit { old, new } => {
                    index.rows.remove(&sort_key(old, spec));
                    index.rows.insert(sort_key(new, spec), new.clone());
                }
            }
        }
    }
}

struct SourceInner {
    id: u64,
    spec: TableSpec,
    primary_sort: OrderBy,
    state: Mutex<SourceState>,
    open_cursors: AtomicUsize,
}

impl SourceInner {
    fn lookup(&self, state: &SourceState, key: &RowKey) -> Option<Row> {
        let index = state.indexes.get(&self.primary_sort)?;
        let sort_key: SortKey = key
            .iter()
            .map(|v| KeyPart::Val(v.clone(), Direction::Asc))
            .collect();
        index.rows.get(&sort_key).cloned()
    }

    fn not_found(&self, key: &RowKey) -> IvmError {
        IvmError::RowNotFound {
            table: self.spec.name.clone(),
            key: display_key(key),
        }
    }

    /// Turns a requested change into the concrete changes to deliver, checked
    /// against the current data.
    fn resolve(&self, state: &SourceState, change: SourceChange) -> Result<Vec<SourceChange>, IvmError> {
        let pk = &self.spec.primary_key;
        match change {
            SourceChange::Add(row) => {
                let key = row_key(&row, pk);
                Ok(match self.lookup(state, &key) {
                    Some(existing) if existing == row => Vec::new(),
                    Some(existing) => vec![SourceChange::Edit {
                        old: existing,
                        new: row,
                    }],
                    None => vec![SourceChange::Add(row)],
                })
            }
            SourceChange::Remove(row) => {
                let key = row_key(&row, pk);
                let existing = self.lookup(state, &key).ok_or_else(|| self.not_found(&key))?;
                Ok(vec![SourceChange::Remove(existing)])
            }
            SourceChange::Edit { old, new } => {
                let old_key = row_key(&old, pk);
                let existing = self
                    .lookup(state, &old_key)
                    .ok_or_else(|| self.not_found(&old_key))?;
                let new_key = row_key(&new, pk);
                if new_key == old_key {
                    if existing == new {
                        return Ok(Vec::new());
                    }
                    return Ok(vec![SourceChange::Edit { old: existing, new }]);
                }
                let mut out = vec![SourceChange::Remove(existing)];
                out.extend(self.resolve(state, SourceChange::Add(new))?);
                Ok(out)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-process source backed by sorted in-memory indexes.
///
/// Cheap to clone: clones share the same table.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<SourceInner>,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("id", &self.inner.id)
            .field("table", &self.inner.spec.name)
            .finish_non_exhaustive()
    }
}

impl MemorySource {
    #[must_use]
    pub fn new(spec: TableSpec) -> Self {
        let primary_sort: OrderBy = spec
            .primary_key
            .iter()
            .map(|c| (c.clone(), Direction::Asc))
            .collect();
        let mut indexes = BTreeMap::new();
        indexes.insert(primary_sort.clone(), Index::default());
        Self {
            inner: Arc::new(SourceInner {
                id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
                spec,
                primary_sort,
                state: Mutex::new(SourceState {
                    indexes,
                    connections: BTreeMap::new(),
                    next_connection: 0,
                    overlay: None,
                    pending: Vec::new(),
                    seq: 0,
                }),
                open_cursors: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of rows currently applied.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .indexes
            .get(&self.inner.primary_sort)
            .map_or(0, |i| i.rows.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a row by primary key.
    #[must_use]
    pub fn get(&self, key: &RowKey) -> Option<Row> {
        let state = self.inner.state.lock();
        self.inner.lookup(&state, key)
    }

    /// All rows in primary-key order.
    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        let state = self.inner.state.lock();
        state
            .indexes
            .get(&self.inner.primary_sort)
            .map(|i| i.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts rows directly, without delivering them to any connection.
    /// Used to seed a source from a replica snapshot before pipelines exist.
    pub fn load(&self, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.inner.state.lock();
        for row in rows {
            let key = row_key(&row, &self.inner.spec.primary_key);
            let change = match self.inner.lookup(&state, &key) {
                Some(old) => SourceChange::Edit { old, new: row },
                None => SourceChange::Add(row),
            };
            state.apply(&change);
        }
    }

    /// Number of fetch cursors that have not been dropped yet.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursors.load(Ordering::Relaxed)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Number of sorted indexes, the primary index included.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.inner.state.lock().indexes.len()
    }

    fn disconnect(&self, connection: u32) {
        let mut state = self.inner.state.lock();
        state.connections.remove(&connection);
        let primary = self.inner.primary_sort.clone();
        state.indexes.retain(|spec, index| {
            index.used_by.remove(&connection);
            *spec == primary || !index.used_by.is_empty()
        });
        debug!(table = %self.inner.spec.name, connection, "source connection closed");
    }

    fn cursor(&self, connection: u32, req: &FetchRequest) -> SourceCursor {
        let mut state = self.inner.state.lock();
        let Some(conn) = state.connections.get(&connection) else {
            return SourceCursor::empty(Arc::clone(&self.inner));
        };
        let sort = conn.sort.clone();

        // Constraint columns first, then the connection's ordering.
        let mut index_spec: OrderBy = Vec::new();
        if let Some(constraint) = &req.constraint {
            if constraint.values().any(Value::is_null) {
                return SourceCursor::empty(Arc::clone(&self.inner));
            }
            index_spec.extend(constraint.keys().map(|c| (c.clone(), Direction::Asc)));
        }
        index_spec.extend(sort);

        if !state.indexes.contains_key(&index_spec) {
            let rows: Vec<Row> = state
                .indexes
                .get(&self.inner.primary_sort)
                .map(|i| i.rows.values().cloned().collect())
                .unwrap_or_default();
            let mut index = Index::default();
            for row in rows {
                index.rows.insert(sort_key(&row, &index_spec), row);
            }
            trace!(table = %self.inner.spec.name, ?index_spec, "created index");
            state.indexes.insert(index_spec.clone(), index);
        }
        if let Some(index) = state.indexes.get_mut(&index_spec) {
            index.used_by.insert(connection);
        }

        let (mut lower, mut upper) = match &req.constraint {
            Some(constraint) => {
                let prefix: SortKey = constraint
                    .values()
                    .map(|v| KeyPart::Val(v.clone(), Direction::Asc))
                    .collect();
                let mut lo = prefix.clone();
                lo.push(KeyPart::Min);
                let mut hi = prefix;
                hi.push(KeyPart::Max);
                (Bound::Included(lo), Bound::Included(hi))
            }
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        if let Some(start) = &req.start {
            let mut start_row = start.row.clone();
            if let Some(constraint) = &req.constraint {
                for (c, v) in constraint {
                    start_row.insert(c.clone(), v.clone());
                }
            }
            let key = sort_key(&start_row, &index_spec);
            let bound = match start.basis {
                Basis::At => Bound::Included(key),
                Basis::After => Bound::Excluded(key),
            };
            if req.reverse {
                upper = bound;
            } else {
                lower = bound;
            }
        }

        let mut overlay_add = None;
        let mut overlay_remove = None;
        if let Some(overlay) = state.overlay.as_ref().filter(|o| connection <= o.connection) {
            let matches = |row: &Row| {
                req.constraint
                    .as_ref()
                    .map_or(true, |c| constraint_matches(row, c))
            };
            let (removed, added) = match &overlay.change {
                SourceChange::Add(row) => (None, Some(row)),
                SourceChange::Remove(row) => (Some(row), None),
                SourceChange::Edit { old, new } => (Some(old), Some(new)),
            };
            if let Some(row) = removed {
                overlay_remove = Some(sort_key(row, &index_spec));
            }
            if let Some(row) = added.filter(|r| matches(r)) {
                let key = sort_key(row, &index_spec);
                if within(&key, &lower, &upper) {
                    overlay_add = Some((key, row.clone()));
                }
            }
        }

        drop(state);
        SourceCursor::new(
            Arc::clone(&self.inner),
            index_spec,
            (lower, upper),
            req.reverse,
            overlay_add,
            overlay_remove,
        )
    }

    /// Delivers one concrete change to every subscribed connection, then
    /// applies it.
    fn deliver(&self, change: &SourceChange, touched: &mut Vec<Arc<dyn ChangeSink>>) {
        let (seq, targets) = {
            let mut state = self.inner.state.lock();
            state.seq += 1;
            let mut targets: Vec<(u32, Vec<Arc<dyn ChangeSink>>)> = Vec::new();
            for (index, conn) in &mut state.connections {
                conn.sinks.retain(|s| s.strong_count() > 0);
                let sinks: Vec<Arc<dyn ChangeSink>> =
                    conn.sinks.iter().filter_map(Weak::upgrade).collect();
                if !sinks.is_empty() {
                    targets.push((*index, sinks));
                }
            }
            (state.seq, targets)
        };

        for (index, sinks) in targets {
            self.inner.state.lock().overlay = Some(Overlay {
                connection: index,
                change: change.clone(),
            });
            let push = SourcePush {
                connection: ConnectionId {
                    source: self.inner.id,
                    index,
                },
                seq,
                change: change.clone(),
            };
            for sink in sinks {
                sink.push(&push);
                let seen = touched
                    .iter()
                    .any(|t| Arc::as_ptr(t).cast::<()>() == Arc::as_ptr(&sink).cast::<()>());
                if !seen {
                    touched.push(sink);
                }
            }
        }

        let mut state = self.inner.state.lock();
        state.overlay = None;
        state.apply(change);
    }
}

impl Source for MemorySource {
    fn spec(&self) -> &TableSpec {
        &self.inner.spec
    }

    fn connect(&self, sort: &[OrderPart]) -> (ConnectionId, BoxedOperator) {
        let schema = SourceSchema::for_table(&self.inner.spec, sort);
        let index = {
            let mut state = self.inner.state.lock();
            let index = state.next_connection;
            state.next_connection += 1;
            state.connections.insert(
                index,
                ConnectionState {
                    sort: schema.sort.clone(),
                    sinks: Vec::new(),
                },
            );
            index
        };
        let connection = ConnectionId {
            source: self.inner.id,
            index,
        };
        let input = SourceInput {
            source: self.clone(),
            connection,
            schema,
            destroyed: false,
        };
        (connection, Box::new(input))
    }

    fn subscribe(&self, connection: ConnectionId, sink: Weak<dyn ChangeSink>) {
        if connection.source != self.inner.id {
            return;
        }
        let mut state = self.inner.state.lock();
        if let Some(conn) = state.connections.get_mut(&connection.index) {
            conn.sinks.push(sink);
        }
    }

    fn push(&self, change: SourceChange) {
        self.inner.state.lock().pending.push(change);
    }

    fn commit(&self) -> Result<usize, IvmError> {
        let pending = std::mem::take(&mut self.inner.state.lock().pending);
        let mut touched: Vec<Arc<dyn ChangeSink>> = Vec::new();
        let mut delivered = 0;
        for change in pending {
            let resolved = {
                let state = self.inner.state.lock();
                self.inner.resolve(&state, change)?
            };
            for concrete in resolved {
                self.deliver(&concrete, &mut touched);
                delivered += 1;
            }
        }
        for sink in touched {
            sink.commit();
        }
        Ok(delivered)
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Lazy cursor over one index range.
///
/// The cursor re-locks the source for each step and remembers its position
/// as a bound, so no lock is held between steps and fetches may nest. The
/// overlay change captured at creation is merged in order.
pub struct SourceCursor {
    inner: Arc<SourceInner>,
    index_spec: OrderBy,
    lower: Bound<SortKey>,
    upper: Bound<SortKey>,
    reverse: bool,
    overlay_add: Option<(SortKey, Row)>,
    overlay_remove: Option<SortKey>,
    lookahead: Option<(SortKey, Row)>,
    exhausted: bool,
}

impl SourceCursor {
    fn new(
        inner: Arc<SourceInner>,
        index_spec: OrderBy,
        (lower, upper): (Bound<SortKey>, Bound<SortKey>),
        reverse: bool,
        overlay_add: Option<(SortKey, Row)>,
        overlay_remove: Option<SortKey>,
    ) -> Self {
        inner.open_cursors.fetch_add(1, Ordering::Relaxed);
        Self {
            inner,
            index_spec,
            lower,
            upper,
            reverse,
            overlay_add,
            overlay_remove,
            lookahead: None,
            exhausted: false,
        }
    }

    fn empty(inner: Arc<SourceInner>) -> Self {
        let mut cursor = Self::new(
            inner,
            Vec::new(),
            (Bound::Unbounded, Bound::Unbounded),
            false,
            None,
            None,
        );
        cursor.exhausted = true;
        cursor
    }

    fn pull(&mut self) -> Option<(SortKey, Row)> {
        if range_is_empty(&self.lower, &self.upper) {
            return None;
        }
        let state = self.inner.state.lock();
        let index = state.indexes.get(&self.index_spec)?;
        let mut range = index.rows.range((self.lower.clone(), self.upper.clone()));
        let (key, row) = if self.reverse {
            range.next_back()?
        } else {
            range.next()?
        };
        let found = (key.clone(), row.clone());
        drop(state);
        if self.reverse {
            self.upper = Bound::Excluded(found.0.clone());
        } else {
            self.lower = Bound::Excluded(found.0.clone());
        }
        Some(found)
    }
}

impl Iterator for SourceCursor {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        loop {
            if self.lookahead.is_none() && !self.exhausted {
                self.lookahead = self.pull();
                if self.lookahead.is_none() {
                    self.exhausted = true;
                }
            }
            let removed = match (&self.lookahead, &self.overlay_remove) {
                (Some((key, _)), Some(gone)) => key == gone,
                _ => false,
            };
            if !removed {
                break;
            }
            self.lookahead = None;
        }

        match (self.lookahead.take(), self.overlay_add.take()) {
            (None, None) => None,
            (Some((_, row)), None) | (None, Some((_, row))) => Some(Node::new(row)),
            (Some(indexed), Some(added)) => {
                let added_first = if self.reverse {
                    added.0 > indexed.0
                } else {
                    added.0 < indexed.0
                };
                if added_first {
                    self.lookahead = Some(indexed);
                    Some(Node::new(added.1))
                } else {
                    self.overlay_add = Some(added);
                    Some(Node::new(indexed.1))
                }
            }
        }
    }
}

impl Drop for SourceCursor {
    fn drop(&mut self) {
        self.inner.open_cursors.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// SourceInput
// ---------------------------------------------------------------------------

/// Leaf operator bound to one source connection.
pub struct SourceInput {
    source: MemorySource,
    connection: ConnectionId,
    schema: SourceSchema,
    destroyed: bool,
}

impl SourceInput {
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl Operator for SourceInput {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(self.source.cursor(self.connection.index, req))
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        if push.connection != self.connection {
            return Ok(Vec::new());
        }
        Ok(vec![push.change.clone().into_change()])
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.source.disconnect(self.connection.index);
        }
    }
}

impl Drop for SourceInput {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Builds a constraint on a single column.
#[must_use]
pub fn constraint_on(column: &str, value: impl Into<Value>) -> Constraint {
    let mut c = Constraint::new();
    c.insert(column.to_string(), value.into());
    c
}
