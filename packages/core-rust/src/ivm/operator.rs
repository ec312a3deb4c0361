//! The operator trait and the request/push types every operator speaks.

use crate::change::{Change, SourceChange};
use crate::data::{Constraint, Row};
use crate::error::IvmError;
use crate::schema::SourceSchema;
use crate::stream::Stream;

/// Whether a fetch starts at the start row or just past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    At,
    After,
}

/// Starting position of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    pub row: Row,
    pub basis: Basis,
}

/// A fetch request. All fields optional: the default request scans every row
/// in the operator's sort order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    pub reverse: bool,
}

impl FetchRequest {
    #[must_use]
    pub fn constrained(constraint: Constraint) -> Self {
        Self {
            constraint: Some(constraint),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn starting(mut self, row: Row, basis: Basis) -> Self {
        self.start = Some(Start { row, basis });
        self
    }

    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Identifies one input connected to a source.
///
/// `index` orders connections within a source and drives overlay visibility
/// during a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub source: u64,
    pub index: u32,
}

/// A committed source change being delivered to one connection.
///
/// `seq` increases by one for every change a source delivers. Together with
/// the source id it identifies the push, so shared subtrees can recognize a
/// repeated delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePush {
    pub connection: ConnectionId,
    pub seq: u64,
    pub change: SourceChange,
}

impl SourcePush {
    /// Identity of the underlying source change, shared by every connection
    /// it is delivered to.
    #[must_use]
    pub fn token(&self) -> (u64, u64) {
        (self.connection.source, self.seq)
    }
}

/// A node in the dataflow graph.
///
/// Operators own their upstream inputs. A push enters at the root, is routed
/// down to the source input whose connection matches, and the resulting
/// changes flow back up, each operator transforming them on the way. Operators
/// keep any private index behind interior mutability so `fetch` can hydrate
/// lazily through `&self`.
pub trait Operator: Send {
    /// Output schema of this operator.
    fn schema(&self) -> &SourceSchema;

    /// Streams nodes in `schema().sort` order, honoring the request's
    /// constraint, start position, and direction.
    fn fetch(&self, req: &FetchRequest) -> Stream<'_>;

    /// Like `fetch`, but tells stateful operators that the caller will not
    /// fetch these nodes again, so per-partition state may be released.
    fn cleanup(&self, req: &FetchRequest) -> Stream<'_> {
        self.fetch(req)
    }

    /// Routes a source push through this subtree and returns the changes the
    /// operator emits, in order.
    ///
    /// # Errors
    ///
    /// Returns an error when an internal invariant is violated. The subtree is
    /// then corrupted and must be rebuilt.
    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError>;

    /// Releases this operator and everything upstream of it.
    fn destroy(&mut self);
}

/// Boxed operator, the unit of composition.
pub type BoxedOperator = Box<dyn Operator>;
