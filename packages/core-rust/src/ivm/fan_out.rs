//! FanOut: one compiled subtree shared by several consumers.
//!
//! Every consumer holds a [`FanOutOutput`]. The first output to receive a
//! given source push runs it through the shared input; the others get the
//! cached result. Each distinct push is stamped with a sequence number and
//! every output checks that the numbers it sees strictly increase, so a
//! consumer that is handed the same push twice fails loudly instead of
//! applying it twice.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::change::Change;
use crate::data::Node;
use crate::error::IvmError;
use crate::ivm::operator::{Basis, BoxedOperator, ConnectionId, FetchRequest, Operator, SourcePush};
use crate::schema::SourceSchema;
use crate::stream::Stream;

/// Nodes pulled from the shared input per lock acquisition.
const FETCH_CHUNK: usize = 64;

struct LastPush {
    connection: ConnectionId,
    source_seq: u64,
    seq: u64,
    changes: Vec<Change>,
}

struct FanOutCore {
    input: BoxedOperator,
    next_seq: u64,
    last: Option<LastPush>,
    outputs: usize,
    destroyed: bool,
}

impl FanOutCore {
    fn push(&mut self, push: &SourcePush) -> Result<(u64, Vec<Change>), IvmError> {
        if let Some(last) = &self.last {
            if last.connection == push.connection && last.source_seq == push.seq {
                return Ok((last.seq, last.changes.clone()));
            }
        }
        let changes = self.input.push(push)?;
        self.next_seq += 1;
        self.last = Some(LastPush {
            connection: push.connection,
            source_seq: push.seq,
            seq: self.next_seq,
            changes: changes.clone(),
        });
        Ok((self.next_seq, changes))
    }
}

/// Shared handle to a subtree. Create outputs with [`FanOut::output`].
#[derive(Clone)]
pub struct FanOut {
    core: Arc<Mutex<FanOutCore>>,
    schema: SourceSchema,
}

impl FanOut {
    #[must_use]
    pub fn new(input: BoxedOperator) -> Self {
        let schema = input.schema().clone();
        Self {
            core: Arc::new(Mutex::new(FanOutCore {
                input,
                next_seq: 0,
                last: None,
                outputs: 0,
                destroyed: false,
            })),
            schema,
        }
    }

    /// Adds a consumer. Returns `None` once the shared input has been torn
    /// down.
    #[must_use]
    pub fn output(&self) -> Option<FanOutOutput> {
        let mut core = self.core.lock();
        if core.destroyed {
            return None;
        }
        core.outputs += 1;
        Some(FanOutOutput {
            core: Arc::clone(&self.core),
            schema: self.schema.clone(),
            last_seq: core.next_seq,
            destroyed: false,
        })
    }

    /// Number of live outputs.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.core.lock().outputs
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.core.lock().destroyed
    }
}

/// One consumer's view of a shared subtree.
pub struct FanOutOutput {
    core: Arc<Mutex<FanOutCore>>,
    schema: SourceSchema,
    last_seq: u64,
    destroyed: bool,
}

impl Operator for FanOutOutput {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(ChunkedFetch {
            core: Arc::clone(&self.core),
            req: req.clone(),
            buffer: Vec::new().into_iter(),
            done: false,
        })
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        let (seq, changes) = self.core.lock().push(push)?;
        if seq <= self.last_seq {
            return Err(IvmError::invariant(
                "fan-out",
                format!("push {seq} delivered again after {}", self.last_seq),
            ));
        }
        self.last_seq = seq;
        Ok(changes)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let mut core = self.core.lock();
        core.outputs = core.outputs.saturating_sub(1);
        if core.outputs == 0 && !core.destroyed {
            core.destroyed = true;
            core.input.destroy();
            debug!(table = %self.schema.table_name, "shared subtree torn down");
        }
    }
}

impl Drop for FanOutOutput {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pulls the shared input in chunks, resuming just after the last node seen.
/// The lock is only held while a chunk is read.
struct ChunkedFetch {
    core: Arc<Mutex<FanOutCore>>,
    req: FetchRequest,
    buffer: std::vec::IntoIter<Node>,
    done: bool,
}

impl Iterator for ChunkedFetch {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        if let Some(node) = self.buffer.next() {
            return Some(node);
        }
        if self.done {
            return None;
        }
        let chunk: Vec<Node> = {
            let core = self.core.lock();
            let mut nodes = Vec::with_capacity(FETCH_CHUNK);
            if !core.destroyed {
                nodes.extend(core.input.fetch(&self.req).take(FETCH_CHUNK));
            }
            nodes
        };
        if chunk.len() < FETCH_CHUNK {
            self.done = true;
        }
        if let Some(last) = chunk.last() {
            self.req = self.req.clone().starting(last.row.clone(), Basis::After);
        }
        self.buffer = chunk.into_iter();
        self.buffer.next()
    }
}
