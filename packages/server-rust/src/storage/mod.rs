//! Persistence for the replica and for client view records.
//!
//! Two traits, each with an in-memory implementation and a `redb` one:
//!
//! - [`ReplicaStore`]: the local copy of the upstream tables plus the
//!   watermark of the last applied transaction. Writes arrive as one
//!   [`ReplicaBatch`] per transaction and are applied atomically.
//! - [`CvrStore`]: one [`CvrRecord`] per client group, flushed with an
//!   optimistic version check so two writers cannot interleave.

pub mod cvr;
pub mod replica;
#[cfg(feature = "redb")]
pub mod redb_store;

use async_trait::async_trait;
use viewsync_core::data::{Row, RowKey};
use viewsync_core::{CvrVersion, TableSpec};

use crate::cvr::CvrRecord;

pub use cvr::MemoryCvrStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbStore;
pub use replica::MemoryReplica;

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// One row-level write inside a [`ReplicaBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    Upsert { table: String, key: RowKey, row: Row },
    Delete { table: String, key: RowKey },
    Truncate { table: String },
}

/// Everything one upstream transaction changes in the replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaBatch {
    /// Lexi watermark of the transaction's commit.
    pub watermark: String,
    /// Tables first seen in this transaction.
    pub new_tables: Vec<TableSpec>,
    pub writes: Vec<RowWrite>,
}

/// A consistent copy of the replica at one watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub watermark: Option<String>,
    pub tables: Vec<(TableSpec, Vec<Row>)>,
}

/// Local copy of the upstream database.
///
/// Used as `Arc<dyn ReplicaStore>`.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Watermark of the last applied batch, `None` before the first.
    async fn watermark(&self) -> anyhow::Result<Option<String>>;

    /// Every declared table.
    async fn tables(&self) -> anyhow::Result<Vec<TableSpec>>;

    /// Declares a table outside of a batch. Re-declaring replaces the spec
    /// and keeps the rows.
    async fn declare_table(&self, spec: &TableSpec) -> anyhow::Result<()>;

    async fn get(&self, table: &str, key: &RowKey) -> anyhow::Result<Option<Row>>;

    async fn scan(&self, table: &str) -> anyhow::Result<Vec<Row>>;

    /// Applies the batch and moves the watermark, all or nothing.
    async fn apply(&self, batch: &ReplicaBatch) -> anyhow::Result<()>;

    /// Reads every table and the watermark in one consistent view.
    async fn snapshot(&self) -> anyhow::Result<ReplicaSnapshot>;
}

// ---------------------------------------------------------------------------
// Client view records
// ---------------------------------------------------------------------------

/// Storage for client view records.
///
/// Used as `Arc<dyn CvrStore>`.
#[async_trait]
pub trait CvrStore: Send + Sync {
    async fn load(&self, client_group_id: &str) -> anyhow::Result<Option<CvrRecord>>;

    /// Writes `record` if the stored version still equals `expected`
    /// (`None`: nothing stored yet).
    ///
    /// # Errors
    ///
    /// A [`StorageError::Conflict`](crate::error::StorageError::Conflict)
    /// wrapped in `anyhow` when another writer got there first.
    async fn flush(&self, record: &CvrRecord, expected: Option<&CvrVersion>)
        -> anyhow::Result<()>;

    async fn delete(&self, client_group_id: &str) -> anyhow::Result<()>;

    /// Deletes records inactive for longer than `ttl_ms` and returns their ids.
    async fn gc(&self, now_ms: u64, ttl_ms: u64) -> anyhow::Result<Vec<String>>;

    async fn ids(&self) -> anyhow::Result<Vec<String>>;
}

/// Shared conflict check for [`CvrStore::flush`] implementations.
pub(crate) fn check_expected(
    client_group_id: &str,
    stored: Option<&CvrVersion>,
    expected: Option<&CvrVersion>,
) -> anyhow::Result<()> {
    if stored == expected {
        return Ok(());
    }
    Err(crate::error::StorageError::Conflict {
        client_group: client_group_id.to_string(),
        expected: expected.map(CvrVersion::cookie),
        actual: stored.map(CvrVersion::cookie),
    }
    .into())
}

/// `true` if `err` is a flush conflict.
#[must_use]
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<crate::error::StorageError>(),
        Some(crate::error::StorageError::Conflict { .. })
    )
}

/// Key under which a replica row is stored: table, NUL, JSON of the key.
pub(crate) fn replica_row_key(table: &str, key: &RowKey) -> String {
    let key = serde_json::to_string(key).unwrap_or_default();
    format!("{table}\u{0}{key}")
}
