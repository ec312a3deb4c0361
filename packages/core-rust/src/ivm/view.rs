//! View materializer: turns the output of an operator graph into a tree.
//!
//! The tree mirrors the query shape. Each level is either a sorted list of
//! entries or a single optional entry, as chosen by the [`Format`]. Entries and
//! lists live behind `Arc`s and are updated with `Arc::make_mut`, so a snapshot
//! handed to a listener stays valid and only the branches touched by later
//! changes are copied. Untouched branches keep their pointer identity across
//! snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::ast::Ast;
use crate::change::Change;
use crate::data::{Node, Row};
use crate::error::IvmError;
use crate::ivm::operator::{BoxedOperator, FetchRequest, SourcePush};
use crate::ivm::source::ChangeSink;
use crate::schema::SourceSchema;

/// Shape of a materialized level: singular or list, plus the shape of each
/// relationship that should be materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Format {
    pub singular: bool,
    pub relationships: BTreeMap<String, Format>,
}

impl Format {
    /// Format for the result of `ast`: a list at the top, and one nested
    /// format per join. Junction joins materialize under their own name
    /// because the hidden junction level is flattened.
    #[must_use]
    pub fn from_ast(ast: &Ast) -> Self {
        Self {
            singular: false,
            relationships: ast
                .joins
                .iter()
                .map(|join| {
                    let nested = Format::from_ast(&join.other);
                    (
                        join.relationship.clone(),
                        Format {
                            singular: join.singular,
                            relationships: nested.relationships,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// One materialized row plus its materialized relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub row: Row,
    pub relationships: BTreeMap<String, ViewData>,
}

impl Entry {
    fn new(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }

    /// Row columns and relationships as one JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut object: serde_json::Map<String, serde_json::Value> = self
            .row
            .iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect();
        for (name, data) in &self.relationships {
            object.insert(name.clone(), data.to_json());
        }
        serde_json::Value::Object(object)
    }
}

/// A materialized level.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewData {
    List(Arc<Vec<Arc<Entry>>>),
    Singular(Option<Arc<Entry>>),
}

impl ViewData {
    fn empty(singular: bool) -> Self {
        if singular {
            ViewData::Singular(None)
        } else {
            ViewData::List(Arc::new(Vec::new()))
        }
    }

    /// Entries at this level, in view order.
    #[must_use]
    pub fn entries(&self) -> &[Arc<Entry>] {
        match self {
            ViewData::List(list) => list.as_slice(),
            ViewData::Singular(Some(entry)) => std::slice::from_ref(entry),
            ViewData::Singular(None) => &[],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ViewData::List(list) => {
                serde_json::Value::Array(list.iter().map(|entry| entry.to_json()).collect())
            }
            ViewData::Singular(entry) => entry
                .as_ref()
                .map_or(serde_json::Value::Null, |entry| entry.to_json()),
        }
    }
}

// ---------------------------------------------------------------------------
// Applying changes
// ---------------------------------------------------------------------------

fn child_schema<'a>(schema: &'a SourceSchema, relationship: &str) -> Result<&'a SourceSchema, IvmError> {
    schema.relationships.get(relationship).ok_or_else(|| {
        IvmError::invariant(
            "view",
            format!("{} has no relationship {relationship}", schema.table_name),
        )
    })
}

fn slot<'a>(parent: &'a mut Entry, relationship: &str, format: &Format) -> &'a mut ViewData {
    parent
        .relationships
        .entry(relationship.to_string())
        .or_insert_with(|| ViewData::empty(format.singular))
}

fn position(list: &[Arc<Entry>], row: &Row, schema: &SourceSchema) -> Result<usize, usize> {
    list.binary_search_by(|entry| schema.compare_rows(&entry.row, row))
}

fn find(list: &[Arc<Entry>], row: &Row, schema: &SourceSchema) -> Result<usize, IvmError> {
    position(list, row, schema)
        .map_err(|_| IvmError::invariant("view", format!("row missing from {}", schema.table_name)))
}

fn insert(list: &mut Vec<Arc<Entry>>, entry: Arc<Entry>, schema: &SourceSchema) -> Result<(), IvmError> {
    match position(list, &entry.row, schema) {
        Ok(_) => Err(IvmError::invariant(
            "view",
            format!("row already present in {}", schema.table_name),
        )),
        Err(pos) => {
            list.insert(pos, entry);
            Ok(())
        }
    }
}

/// Applies one change below `parent` under `relationship`.
fn apply_change(
    parent: &mut Entry,
    change: Change,
    schema: &SourceSchema,
    relationship: &str,
    format: &Format,
) -> Result<(), IvmError> {
    if schema.is_hidden {
        // Hidden levels contribute their children straight to the parent.
        return match change {
            Change::Add(node) => {
                for (name, children) in node.relationships {
                    let nested = child_schema(schema, &name)?;
                    for child in children {
                        apply_change(parent, Change::Add(child), nested, relationship, format)?;
                    }
                }
                Ok(())
            }
            Change::Remove(node) => {
                for (name, children) in node.relationships {
                    let nested = child_schema(schema, &name)?;
                    for child in children {
                        apply_change(parent, Change::Remove(child), nested, relationship, format)?;
                    }
                }
                Ok(())
            }
            // An edit that changed the hidden row's relationships arrives as
            // remove + add.
            Change::Edit { .. } => Ok(()),
            Change::Child { child, .. } => {
                let nested = child_schema(schema, &child.relationship)?;
                apply_change(parent, *child.change, nested, relationship, format)
            }
        };
    }

    match change {
        Change::Add(node) => {
            let entry = build_entry(node, schema, format)?;
            match slot(parent, relationship, format) {
                ViewData::Singular(existing) => {
                    if existing.is_some() {
                        return Err(IvmError::invariant(
                            "view",
                            format!("singular relationship {relationship} already has an entry"),
                        ));
                    }
                    *existing = Some(Arc::new(entry));
                    Ok(())
                }
                ViewData::List(list) => insert(Arc::make_mut(list), Arc::new(entry), schema),
            }
        }
        Change::Remove(node) => match slot(parent, relationship, format) {
            ViewData::Singular(existing) => {
                if existing.take().is_none() {
                    return Err(IvmError::invariant(
                        "view",
                        format!("singular relationship {relationship} is already empty"),
                    ));
                }
                Ok(())
            }
            ViewData::List(list) => {
                let pos = find(list, &node.row, schema)?;
                Arc::make_mut(list).remove(pos);
                Ok(())
            }
        },
        Change::Child { row, child } => {
            let Some(child_format) = format.relationships.get(&child.relationship) else {
                return Ok(());
            };
            let nested = child_schema(schema, &child.relationship)?;
            let existing = match slot(parent, relationship, format) {
                ViewData::Singular(Some(entry)) => Arc::make_mut(entry),
                ViewData::Singular(None) => {
                    return Err(IvmError::invariant(
                        "view",
                        format!("child change under empty singular {relationship}"),
                    ))
                }
                ViewData::List(list) => {
                    let pos = find(list, &row, schema)?;
                    Arc::make_mut(&mut Arc::make_mut(list)[pos])
                }
            };
            apply_change(existing, *child.change, nested, &child.relationship, child_format)
        }
        Change::Edit { old, new } => match slot(parent, relationship, format) {
            ViewData::Singular(Some(entry)) => {
                Arc::make_mut(entry).row = new.row;
                Ok(())
            }
            ViewData::Singular(None) => Err(IvmError::invariant(
                "view",
                format!("edit under empty singular {relationship}"),
            )),
            ViewData::List(list) => {
                let pos = find(list, &old.row, schema)?;
                let list = Arc::make_mut(list);
                if schema.compare_rows(&old.row, &new.row).is_eq() {
                    Arc::make_mut(&mut list[pos]).row = new.row;
                    Ok(())
                } else {
                    // Moved: reinsert, keeping the materialized relationships.
                    let mut entry = list.remove(pos);
                    Arc::make_mut(&mut entry).row = new.row;
                    insert(list, entry, schema)
                }
            }
        },
    }
}

fn build_entry(node: Node, schema: &SourceSchema, format: &Format) -> Result<Entry, IvmError> {
    let mut entry = Entry::new(node.row);
    for (name, children) in node.relationships {
        let Some(child_format) = format.relationships.get(&name) else {
            continue;
        };
        let nested = child_schema(schema, &name)?;
        entry
            .relationships
            .insert(name.clone(), ViewData::empty(child_format.singular));
        for child in children {
            apply_change(&mut entry, Change::Add(child), nested, &name, child_format)?;
        }
    }
    Ok(entry)
}

// ---------------------------------------------------------------------------
// ArrayView
// ---------------------------------------------------------------------------

/// Receives each new snapshot of a view.
pub type Listener = Box<dyn FnMut(&ViewData) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Materialized view of an operator graph's output.
pub struct ArrayView {
    input: BoxedOperator,
    schema: SourceSchema,
    format: Format,
    // Synthetic root whose "" relationship holds the view itself, so root
    // changes go through the same path as nested ones.
    root: Entry,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    hydrated: bool,
    dirty: bool,
    destroyed: bool,
}

impl ArrayView {
    #[must_use]
    pub fn new(input: BoxedOperator, format: Format) -> Self {
        let schema = input.schema().clone();
        let mut root = Entry::new(Row::new());
        root.relationships
            .insert(String::new(), ViewData::empty(format.singular));
        Self {
            input,
            schema,
            format,
            root,
            listeners: Vec::new(),
            next_listener: 0,
            hydrated: false,
            dirty: false,
            destroyed: false,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Seeds the view with a full fetch and notifies listeners.
    ///
    /// # Errors
    ///
    /// [`IvmError::AlreadyHydrated`] on a second call, or an invariant error
    /// if the fetched stream is inconsistent with the format.
    pub fn hydrate(&mut self) -> Result<(), IvmError> {
        if self.hydrated {
            return Err(IvmError::AlreadyHydrated);
        }
        self.hydrated = true;
        for node in self.input.fetch(&FetchRequest::default()) {
            apply_change(&mut self.root, Change::Add(node), &self.schema, "", &self.format)?;
        }
        self.dirty = true;
        self.flush();
        Ok(())
    }

    /// Runs a source push through the graph and applies the result. Listeners
    /// are not notified until [`ArrayView::flush`].
    ///
    /// # Errors
    ///
    /// Propagates operator errors. The view must then be discarded.
    pub fn push(&mut self, push: &SourcePush) -> Result<(), IvmError> {
        let changes = self.input.push(push)?;
        if !self.hydrated {
            return Ok(());
        }
        for change in changes {
            self.dirty = true;
            apply_change(&mut self.root, change, &self.schema, "", &self.format)?;
        }
        Ok(())
    }

    /// Notifies listeners if anything changed since the last flush.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let data = self.data();
        for (_, listener) in &mut self.listeners {
            listener(&data);
        }
    }

    /// Registers a listener. It is called right away when the view is
    /// already hydrated.
    pub fn add_listener(&mut self, mut listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        if self.hydrated {
            listener(&self.data());
        }
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|(existing, _)| *existing != id);
    }

    /// Current snapshot. Cloning shares every entry with the live tree.
    #[must_use]
    pub fn data(&self) -> ViewData {
        self.root
            .relationships
            .get("")
            .cloned()
            .unwrap_or_else(|| ViewData::empty(self.format.singular))
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.data().to_json()
    }

    /// Releases the operator chain and drops all listeners.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.listeners.clear();
        self.input.destroy();
    }
}

/// Adapts an [`ArrayView`] to a source subscription: pushes update the tree
/// and each commit flushes it.
///
/// The first operator error is recorded and later pushes are ignored; the
/// owner checks [`ViewSink::take_error`] after a commit and rebuilds the view.
/// Listeners run while the view is locked and must not lock it again.
pub struct ViewSink {
    view: Mutex<ArrayView>,
    error: Mutex<Option<IvmError>>,
}

impl ViewSink {
    #[must_use]
    pub fn new(view: ArrayView) -> Arc<Self> {
        Arc::new(Self {
            view: Mutex::new(view),
            error: Mutex::new(None),
        })
    }

    pub fn view(&self) -> MutexGuard<'_, ArrayView> {
        self.view.lock()
    }

    pub fn take_error(&self) -> Option<IvmError> {
        self.error.lock().take()
    }
}

impl ChangeSink for ViewSink {
    fn push(&self, push: &SourcePush) {
        if self.error.lock().is_some() {
            return;
        }
        if let Err(e) = self.view.lock().push(push) {
            warn!(error = %e, "view push failed");
            *self.error.lock() = Some(e);
        }
    }

    fn commit(&self) {
        if self.error.lock().is_none() {
            self.view.lock().flush();
        }
    }
}
