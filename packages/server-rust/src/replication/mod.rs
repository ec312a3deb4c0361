//! Replication: upstream events to transactions to replica updates.
//!
//! ```text
//! ChangeSource / MemoryUpstream -> ChangeStreamer -> Replicator -> ReplicaUpdate
//!                                   (whole txns)     (replica)     (view syncers)
//! ```

pub mod event;
pub mod jsonl;
pub mod replicator;
pub mod streamer;
pub mod upstream;

pub use event::{ChangeSourceEvent, DataChange, Publications, CLIENTS_TABLE};
pub use jsonl::{pump, ChangeSource, JsonLinesSource};
pub use replicator::{ReplicaUpdate, Replicator, RowChange};
pub use streamer::{ChangeStreamer, Subscription, Transaction};
pub use upstream::{MemoryUpstream, MutationSink, ReadOnlyUpstream};
