//! Compiles an [`Ast`] into an operator graph.
//!
//! Each level is built as source → filter → aggregate → take, then its joins
//! are stacked on top. A limit inside a relationship is partitioned by the
//! child's join columns so that it counts per parent. A junction relationship
//! compiles to two joins: the parent joins a hidden junction level, which in
//! turn joins the destination under the same relationship name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::ast::{Ast, Condition, Join as JoinAst};
use crate::error::IvmError;
use crate::ivm::aggregate::Aggregate;
use crate::ivm::fan_out::FanOut;
use crate::ivm::filter::Filter;
use crate::ivm::join::{Join, JoinArgs};
use crate::ivm::operator::{BoxedOperator, ConnectionId};
use crate::ivm::predicate::Predicate;
use crate::ivm::source::{ChangeSink, MemorySource, Source};
use crate::ivm::take::Take;
use crate::ivm::view::{ArrayView, Format, ViewSink};
use crate::schema::TableSpec;

/// Looks up sources by table name.
pub trait SourceProvider {
    fn source(&self, table: &str) -> Option<Arc<dyn Source>>;
}

impl SourceProvider for BTreeMap<String, MemorySource> {
    fn source(&self, table: &str) -> Option<Arc<dyn Source>> {
        self.get(table)
            .map(|source| Arc::new(source.clone()) as Arc<dyn Source>)
    }
}

impl SourceProvider for HashMap<String, Arc<dyn Source>> {
    fn source(&self, table: &str) -> Option<Arc<dyn Source>> {
        self.get(table).cloned()
    }
}

/// A source connection opened while compiling.
#[derive(Clone)]
pub struct Connection {
    pub source: Arc<dyn Source>,
    pub id: ConnectionId,
}

/// Result of compiling one query.
pub struct CompiledPipeline {
    pub hash: String,
    pub root: BoxedOperator,
    /// Every source connection the graph reads. A consumer subscribes its
    /// sink to all of them.
    pub connections: Vec<Connection>,
}

impl CompiledPipeline {
    pub fn subscribe(&self, sink: &Arc<dyn ChangeSink>) {
        for conn in &self.connections {
            conn.source.subscribe(conn.id, Arc::downgrade(sink));
        }
    }
}

struct SharedGraph {
    fan_out: FanOut,
    connections: Vec<Connection>,
}

/// State carried across compilations: memoized query hashes and graphs
/// shared between identical queries.
#[derive(Default)]
pub struct CompileContext {
    hashes: HashMap<String, String>,
    shared: HashMap<String, SharedGraph>,
}

impl CompileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of `ast`, memoized on its exact serialized form.
    pub fn hash(&mut self, ast: &Ast) -> String {
        let Ok(raw) = serde_json::to_string(ast) else {
            return ast.hash();
        };
        self.hashes
            .entry(raw)
            .or_insert_with(|| ast.hash())
            .clone()
    }

    /// Compiles `ast` into a fresh graph with its own source connections.
    ///
    /// # Errors
    ///
    /// Unknown tables or columns, bad predicates, aggregates without fields,
    /// and junction relationships with a limit.
    pub fn build(
        &mut self,
        ast: &Ast,
        provider: &dyn SourceProvider,
    ) -> Result<CompiledPipeline, IvmError> {
        let hash = self.hash(ast);
        let mut connections = Vec::new();
        let root = build_level(ast, provider, None, &mut connections)?;
        debug!(query = %hash, connections = connections.len(), "compiled pipeline");
        Ok(CompiledPipeline {
            hash,
            root,
            connections,
        })
    }

    /// Like [`CompileContext::build`], but queries with the same hash share
    /// one graph through a [`FanOut`]. The graph is torn down when the last
    /// sharer destroys its root.
    ///
    /// # Errors
    ///
    /// Same as [`CompileContext::build`].
    pub fn build_shared(
        &mut self,
        ast: &Ast,
        provider: &dyn SourceProvider,
    ) -> Result<CompiledPipeline, IvmError> {
        let hash = self.hash(ast);
        self.shared.retain(|_, graph| !graph.fan_out.is_destroyed());
        if let Some(graph) = self.shared.get(&hash) {
            if let Some(output) = graph.fan_out.output() {
                return Ok(CompiledPipeline {
                    hash,
                    root: Box::new(output),
                    connections: graph.connections.clone(),
                });
            }
        }
        let compiled = self.build(ast, provider)?;
        let fan_out = FanOut::new(compiled.root);
        let output = fan_out.output().ok_or_else(|| {
            IvmError::invariant("builder", "fresh fan-out refused an output")
        })?;
        self.shared.insert(
            hash.clone(),
            SharedGraph {
                fan_out,
                connections: compiled.connections.clone(),
            },
        );
        Ok(CompiledPipeline {
            hash,
            root: Box::new(output),
            connections: compiled.connections,
        })
    }

    /// Number of live shared graphs.
    #[must_use]
    pub fn shared_count(&self) -> usize {
        self.shared
            .values()
            .filter(|graph| !graph.fan_out.is_destroyed())
            .count()
    }
}

/// Compiles `ast`, wraps it in a hydrated view and subscribes the view to
/// every source it reads.
///
/// # Errors
///
/// Compile errors and errors raised while hydrating.
pub fn materialize(
    ast: &Ast,
    provider: &dyn SourceProvider,
    ctx: &mut CompileContext,
) -> Result<Arc<ViewSink>, IvmError> {
    let compiled = ctx.build(ast, provider)?;
    let sink = ViewSink::new(ArrayView::new(compiled.root, Format::from_ast(ast)));
    let dyn_sink: Arc<dyn ChangeSink> = sink.clone();
    for conn in &compiled.connections {
        conn.source.subscribe(conn.id, Arc::downgrade(&dyn_sink));
    }
    sink.view().hydrate()?;
    Ok(sink)
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

fn check_columns<'a>(
    spec: &TableSpec,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<(), IvmError> {
    for column in columns {
        if !spec.has_column(column) {
            return Err(IvmError::UnknownColumn {
                table: spec.name.clone(),
                column: column.clone(),
            });
        }
    }
    Ok(())
}

fn condition_fields(condition: &Condition, out: &mut Vec<String>) {
    match condition {
        Condition::Simple { field, .. } => out.push(field.clone()),
        Condition::Conjunction { conditions, .. } => {
            for c in conditions {
                condition_fields(c, out);
            }
        }
    }
}

fn open(
    table: &str,
    provider: &dyn SourceProvider,
) -> Result<Arc<dyn Source>, IvmError> {
    provider
        .source(table)
        .ok_or_else(|| IvmError::UnknownTable(table.to_string()))
}

fn build_level(
    ast: &Ast,
    provider: &dyn SourceProvider,
    partition: Option<Vec<String>>,
    connections: &mut Vec<Connection>,
) -> Result<BoxedOperator, IvmError> {
    let source = open(&ast.table, provider)?;
    let spec = source.spec();
    let mut fields = Vec::new();
    if let Some(condition) = &ast.where_clause {
        condition_fields(condition, &mut fields);
    }
    check_columns(spec, &fields)?;
    check_columns(spec, ast.order_by.iter().map(|(c, _)| c))?;
    check_columns(spec, ast.select.iter().flatten())?;
    check_columns(spec, ast.joins.iter().flat_map(|j| &j.source_key))?;

    let (id, input) = source.connect(&ast.order_by);
    connections.push(Connection {
        source: Arc::clone(&source),
        id,
    });
    let mut op = input;

    if let Some(condition) = &ast.where_clause {
        op = Box::new(Filter::new(op, Predicate::compile(condition)?));
    }
    if ast.group_by.is_some() || !ast.aggregate.is_empty() {
        op = Box::new(Aggregate::new(
            op,
            ast.group_by.clone().unwrap_or_default(),
            ast.aggregate.clone(),
        )?);
    }
    if let Some(limit) = ast.limit {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        op = Box::new(Take::new(op, limit, partition));
    }
    for join in &ast.joins {
        op = build_join(op, join, provider, connections)?;
    }
    Ok(op)
}

fn build_join(
    parent: BoxedOperator,
    join: &JoinAst,
    provider: &dyn SourceProvider,
    connections: &mut Vec<Connection>,
) -> Result<BoxedOperator, IvmError> {
    let Some(junction) = &join.junction else {
        let child = build_level(&join.other, provider, Some(join.dest_key.clone()), connections)?;
        check_columns(open(&join.other.table, provider)?.spec(), &join.dest_key)?;
        return Ok(Box::new(Join::new(JoinArgs {
            parent,
            child,
            parent_key: join.source_key.clone(),
            child_key: join.dest_key.clone(),
            relationship: join.relationship.clone(),
            hidden: false,
        })?));
    };

    if join.other.limit.is_some() {
        return Err(IvmError::InvalidQuery(format!(
            "relationship {} goes through junction {} and cannot have a limit",
            join.relationship, junction.table
        )));
    }
    let junction_source = open(&junction.table, provider)?;
    check_columns(
        junction_source.spec(),
        junction.source_key.iter().chain(&junction.dest_key),
    )?;
    let (id, junction_input) = junction_source.connect(&[]);
    connections.push(Connection {
        source: junction_source,
        id,
    });

    let dest = build_level(&join.other, provider, Some(join.dest_key.clone()), connections)?;
    let hidden = Join::new(JoinArgs {
        parent: junction_input,
        child: dest,
        parent_key: junction.dest_key.clone(),
        child_key: join.dest_key.clone(),
        relationship: join.relationship.clone(),
        hidden: true,
    })?;
    Ok(Box::new(Join::new(JoinArgs {
        parent,
        child: Box::new(hidden),
        parent_key: join.source_key.clone(),
        child_key: junction.source_key.clone(),
        relationship: join.relationship.clone(),
        hidden: false,
    })?))
}
