//! Incremental view maintenance: sources, operators, views and the builder
//! that wires them together from a query AST.

pub mod aggregate;
pub mod builder;
pub mod fan_out;
pub mod filter;
pub mod join;
pub mod operator;
pub mod predicate;
pub mod source;
pub mod take;
pub mod view;

pub use builder::{materialize, CompileContext, CompiledPipeline, Connection, SourceProvider};
pub use operator::{Basis, BoxedOperator, ConnectionId, FetchRequest, Operator, SourcePush, Start};
pub use source::{ChangeSink, MemorySource, Source};
pub use view::{ArrayView, Entry, Format, ViewData, ViewSink};
