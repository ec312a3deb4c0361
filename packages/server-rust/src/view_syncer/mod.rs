//! View syncers: incremental pipelines per shard and the actors that keep
//! client groups in step with the replica.

pub mod pipeline;
pub mod syncer;

pub use pipeline::{Advance, PipelineDriver};
pub use syncer::{SyncerCommand, SyncerConfig, SyncerDeps, SyncerHandle, SyncerPool, ViewSyncer};
