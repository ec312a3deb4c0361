//! Pipeline driver: the operator graphs of one view syncer.
//!
//! The driver owns an in-memory source per replica table and one pipeline
//! per distinct query, keyed by transformation hash. Every reference to a
//! pipeline is its own consumer of one shared operator graph (a fan-out), so
//! a source push runs through the graph once however many client groups
//! hold the query. Hydration and replica advances are reported as
//! [`RowDelta`]s, which the client view records turn into row patches.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use viewsync_core::data::{row_key, Node, Row};
use viewsync_core::ivm::{
    BoxedOperator, ChangeSink, CompileContext, CompiledPipeline, FetchRequest, MemorySource,
    Source, SourcePush,
};
use viewsync_core::multiset::{normalize, Entry};
use viewsync_core::{Ast, Change, IvmError, SourceChange, SourceSchema, TableSpec};

use crate::cvr::RowDelta;
use crate::replication::{ReplicaUpdate, RowChange, CLIENTS_TABLE};
use crate::storage::ReplicaSnapshot;

/// Collects what one pipeline emits during a commit.
struct PipelineSink {
    root: Mutex<BoxedOperator>,
    schema: SourceSchema,
    pending: Mutex<Vec<Change>>,
    error: Mutex<Option<IvmError>>,
}

impl PipelineSink {
    fn new(root: BoxedOperator) -> Arc<Self> {
        let schema = root.schema().clone();
        Arc::new(Self {
            root: Mutex::new(root),
            schema,
            pending: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        })
    }

    fn hydrate(&self) -> Vec<RowDelta> {
        let root = self.root.lock();
        let mut out = Vec::new();
        for node in root.fetch(&FetchRequest::default()) {
            walk_node(&self.schema, &node, 1, &mut out);
        }
        out
    }

    fn drain(&self) -> Result<Vec<RowDelta>, IvmError> {
        if let Some(e) = self.error.lock().take() {
            self.pending.lock().clear();
            return Err(e);
        }
        let mut out = Vec::new();
        for change in self.pending.lock().drain(..) {
            walk_change(&self.schema, &change, &mut out);
        }
        Ok(net_deltas(out))
    }

    fn destroy(&self) {
        self.root.lock().destroy();
    }
}

impl ChangeSink for PipelineSink {
    fn push(&self, push: &SourcePush) {
        if self.error.lock().is_some() {
            return;
        }
        match self.root.lock().push(push) {
            Ok(changes) => self.pending.lock().extend(changes),
            Err(e) => {
                warn!(table = %self.schema.table_name, error = %e, "pipeline push failed");
                *self.error.lock() = Some(e);
            }
        }
    }
}

fn primary_key_of(schema: &SourceSchema, row: &Row) -> Row {
    schema
        .primary_key
        .iter()
        .filter_map(|c| Some((c.clone(), row.get(c)?.clone())))
        .collect()
}

fn row_delta(schema: &SourceSchema, row: &Row, delta: i64) -> RowDelta {
    RowDelta {
        query_hash: String::new(),
        table: schema.table_name.clone(),
        id: primary_key_of(schema, row),
        row: row.clone(),
        delta,
    }
}

/// A node and everything under it gains or loses one reference.
fn walk_node(schema: &SourceSchema, node: &Node, delta: i64, out: &mut Vec<RowDelta>) {
    out.push(row_delta(schema, &node.row, delta));
    for (name, children) in &node.relationships {
        let Some(child_schema) = schema.relationships.get(name) else {
            continue;
        };
        for child in children {
            walk_node(child_schema, child, delta, out);
        }
    }
}

/// Cancels rows that appeared and disappeared with the same contents within
/// one commit, such as a row backfilled into a limit and evicted again by a
/// later change of the same transaction. An edit keeps both halves since the
/// contents differ.
fn net_deltas(deltas: Vec<RowDelta>) -> Vec<RowDelta> {
    let entries = deltas.into_iter().map(|d| {
        let multiplicity = d.delta;
        Entry::new(d, multiplicity)
    });
    normalize(entries, |d| (d.table.clone(), d.id.clone(), d.row.clone()))
        .into_iter()
        .map(|e| RowDelta {
            delta: e.multiplicity,
            ..e.value
        })
        .collect()
}

fn walk_change(schema: &SourceSchema, change: &Change, out: &mut Vec<RowDelta>) {
    match change {
        Change::Add(node) => walk_node(schema, node, 1, out),
        Change::Remove(node) => walk_node(schema, node, -1, out),
        // Relationships are untouched by an edit.
        Change::Edit { old, new } => {
            out.push(row_delta(schema, &old.row, -1));
            out.push(row_delta(schema, &new.row, 1));
        }
        Change::Child { child, .. } => {
            if let Some(child_schema) = schema.relationships.get(&child.relationship) {
                walk_change(child_schema, &child.change, out);
            }
        }
    }
}

/// Server-side pipelines emit base rows only.
fn check_syncable(ast: &Ast) -> Result<(), IvmError> {
    if ast.group_by.is_some() || !ast.aggregate.is_empty() {
        return Err(IvmError::InvalidQuery(format!(
            "aggregates over {} are evaluated on the client and cannot be synced",
            ast.table
        )));
    }
    ast.joins.iter().try_for_each(|join| check_syncable(&join.other))
}

struct Pipeline {
    ast: Ast,
    /// One consumer per reference, all reading the same shared graph.
    sinks: Vec<Arc<PipelineSink>>,
}

impl Pipeline {
    fn destroy(&self) {
        for sink in &self.sinks {
            sink.destroy();
        }
    }
}

/// What one replica update did to the pipelines.
#[derive(Debug, Default)]
pub struct Advance {
    /// Row deltas per transformation hash.
    pub deltas: BTreeMap<String, Vec<RowDelta>>,
    /// Pipelines whose operators failed; they must be rehydrated.
    pub failed: Vec<(String, IvmError)>,
    /// `_clients` rows written by the update.
    pub clients: Vec<Row>,
}

pub struct PipelineDriver {
    sources: BTreeMap<String, MemorySource>,
    ctx: CompileContext,
    pipelines: BTreeMap<String, Pipeline>,
    version: Option<String>,
}

impl PipelineDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            ctx: CompileContext::new(),
            pipelines: BTreeMap::new(),
            version: None,
        }
    }

    /// Replica version the sources reflect.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Operator graphs alive; identical queries count once.
    #[must_use]
    pub fn shared_graph_count(&self) -> usize {
        self.ctx.shared_count()
    }

    /// Rebuilds every source from `snapshot` and rehydrates every pipeline
    /// against it. Returns the full row set of each pipeline.
    pub fn reset(
        &mut self,
        snapshot: &ReplicaSnapshot,
    ) -> BTreeMap<String, Result<Vec<RowDelta>, IvmError>> {
        for pipeline in self.pipelines.values() {
            pipeline.destroy();
        }
        self.sources = snapshot
            .tables
            .iter()
            .map(|(spec, rows)| {
                let source = MemorySource::new(spec.clone());
                source.load(rows.iter().cloned());
                (spec.name.clone(), source)
            })
            .collect();
        self.version.clone_from(&snapshot.watermark);
        info!(
            version = ?self.version,
            tables = self.sources.len(),
            pipelines = self.pipelines.len(),
            "pipeline driver reset"
        );

        let hashes: Vec<String> = self.pipelines.keys().cloned().collect();
        hashes
            .into_iter()
            .map(|hash| {
                let result = self.rebuild(&hash);
                (hash, result)
            })
            .collect()
    }

    /// Opens a consumer of the shared graph for `ast`, compiling the graph
    /// if no live consumer holds it.
    fn build_sink(&mut self, ast: &Ast) -> Result<Arc<PipelineSink>, IvmError> {
        let CompiledPipeline {
            root, connections, ..
        } = self.ctx.build_shared(ast, &self.sources)?;
        let sink = PipelineSink::new(root);
        let as_sink: Arc<dyn ChangeSink> = sink.clone();
        for conn in &connections {
            conn.source.subscribe(conn.id, Arc::downgrade(&as_sink));
        }
        Ok(sink)
    }

    /// Replaces the pipeline's graph with a fresh one, keeping its number of
    /// references. A pipeline that fails to build is dropped.
    fn rebuild(&mut self, hash: &str) -> Result<Vec<RowDelta>, IvmError> {
        let Some((ast, refs)) = self.pipelines.get(hash).map(|p| {
            // The old graph must be gone before the new one can be shared.
            p.destroy();
            (p.ast.clone(), p.sinks.len().max(1))
        }) else {
            return Err(IvmError::OperatorInvariant {
                operator: "pipeline-driver",
                detail: format!("no pipeline {hash}"),
            });
        };
        let built: Result<Vec<_>, IvmError> = (0..refs).map(|_| self.build_sink(&ast)).collect();
        match built {
            Ok(sinks) => {
                let rows = sinks.first().map(|s| s.hydrate()).unwrap_or_default();
                if let Some(pipeline) = self.pipelines.get_mut(hash) {
                    pipeline.sinks = sinks;
                }
                Ok(rows)
            }
            Err(e) => {
                self.pipelines.remove(hash);
                Err(e)
            }
        }
    }

    /// Adds a reference to the pipeline for `ast`, building and hydrating
    /// it if it does not exist yet. Returns its transformation hash and its
    /// current rows.
    ///
    /// # Errors
    ///
    /// Unknown tables or columns, aggregate queries, and hydration failures.
    pub fn add_query(&mut self, ast: &Ast) -> Result<(String, Vec<RowDelta>), IvmError> {
        check_syncable(ast)?;
        let hash = self.ctx.hash(ast);
        let sink = self.build_sink(ast)?;
        let rows = sink.hydrate();
        match self.pipelines.get_mut(&hash) {
            Some(pipeline) => pipeline.sinks.push(sink),
            None => {
                debug!(pipeline = %hash, table = %ast.table, rows = rows.len(), "pipeline hydrated");
                self.pipelines.insert(
                    hash.clone(),
                    Pipeline {
                        ast: ast.clone(),
                        sinks: vec![sink],
                    },
                );
            }
        }
        Ok((hash, rows))
    }

    /// Drops one reference. The shared graph is destroyed with the last one.
    pub fn remove_query(&mut self, hash: &str) {
        let Some(pipeline) = self.pipelines.get_mut(hash) else {
            return;
        };
        if let Some(sink) = pipeline.sinks.pop() {
            sink.destroy();
        }
        if pipeline.sinks.is_empty() {
            self.pipelines.remove(hash);
            debug!(pipeline = %hash, "pipeline destroyed");
        }
    }

    /// Rebuilds one pipeline after an operator error.
    ///
    /// # Errors
    ///
    /// The pipeline could not be rebuilt; it has been dropped.
    pub fn rehydrate(&mut self, hash: &str) -> Result<Vec<RowDelta>, IvmError> {
        info!(pipeline = %hash, "rehydrating pipeline");
        self.rebuild(hash)
    }

    /// Pushes one replica update through every pipeline. All changes of the
    /// transaction are buffered first and each touched source commits once.
    ///
    /// # Errors
    ///
    /// The update does not follow the driver's version, or a source rejected
    /// a change. Both leave the sources unusable; the caller must
    /// [`reset`](PipelineDriver::reset).
    pub fn advance(&mut self, update: &ReplicaUpdate) -> Result<Advance, IvmError> {
        if update.previous != self.version {
            return Err(IvmError::OperatorInvariant {
                operator: "pipeline-driver",
                detail: format!(
                    "update from {:?} does not follow {:?}",
                    update.previous, self.version
                ),
            });
        }
        for spec in &update.new_tables {
            self.add_table(spec);
        }

        let mut clients = Vec::new();
        let mut touched: Vec<&str> = Vec::new();
        for change in &update.changes {
            let table = change.table();
            let Some(source) = self.sources.get(table) else {
                return Err(IvmError::UnknownTable(table.to_string()));
            };
            let source_change = match change {
                RowChange::Add { row, .. } => SourceChange::Add(row.clone()),
                RowChange::Edit { old, new, .. } => SourceChange::Edit {
                    old: old.clone(),
                    new: new.clone(),
                },
                RowChange::Remove { row, .. } => SourceChange::Remove(row.clone()),
            };
            if table == CLIENTS_TABLE {
                if let RowChange::Add { row, .. } | RowChange::Edit { new: row, .. } = change {
                    clients.push(row.clone());
                }
            }
            source.push(source_change);
            if !touched.contains(&table) {
                touched.push(table);
            }
        }
        for table in touched {
            if let Some(source) = self.sources.get(table) {
                source.commit()?;
            }
        }
        self.version = Some(update.version.clone());

        let mut advance = Advance {
            clients,
            ..Advance::default()
        };
        for (hash, pipeline) in &self.pipelines {
            // Consumers of one graph see the same changes; report them once.
            let mut deltas = None;
            let mut error = None;
            for sink in &pipeline.sinks {
                match sink.drain() {
                    Ok(d) => {
                        deltas.get_or_insert(d);
                    }
                    Err(e) => {
                        error.get_or_insert(e);
                    }
                }
            }
            match (error, deltas) {
                (Some(e), _) => advance.failed.push((hash.clone(), e)),
                (None, Some(d)) if !d.is_empty() => {
                    advance.deltas.insert(hash.clone(), d);
                }
                _ => {}
            }
        }
        Ok(advance)
    }

    fn add_table(&mut self, spec: &TableSpec) {
        self.sources
            .entry(spec.name.clone())
            .or_insert_with(|| MemorySource::new(spec.clone()));
    }

    /// Current contents of a row, by primary-key columns.
    #[must_use]
    pub fn get_row(&self, table: &str, id: &Row) -> Option<Row> {
        let source = self.sources.get(table)?;
        source.get(&row_key(id, &source.spec().primary_key))
    }

    /// Last mutation id per client of `client_group_id`, from `_clients`.
    #[must_use]
    pub fn last_mutation_ids(&self, client_group_id: &str) -> BTreeMap<String, u64> {
        let Some(source) = self.sources.get(CLIENTS_TABLE) else {
            return BTreeMap::new();
        };
        source
            .rows()
            .iter()
            .filter(|row| {
                row.get("clientGroupID").and_then(|v| v.as_str()) == Some(client_group_id)
            })
            .filter_map(|row| {
                let client = row.get("clientID")?.as_str()?.to_string();
                let last = u64::try_from(row.get("lastMutationID")?.as_i64()?).ok()?;
                Some((client, last))
            })
            .collect()
    }
}

impl Default for PipelineDriver {
    fn default() -> Self {
        Self::new()
    }
}
