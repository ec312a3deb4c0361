//! Client view records.
//!
//! A CVR is the server's picture of what one client group has: which queries
//! each client desires, which queries have been executed ("got") for the
//! group, and every row those queries produced, with reference counts per
//! query. Each entry carries the version at which it was last patched, which
//! is what lets a reconnecting client catch up from its cookie with only the
//! entries that changed since.

pub mod catchup;
pub mod updater;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use viewsync_core::data::Row;
use viewsync_core::hash::fnv1a_hash;
use viewsync_core::{Ast, CvrVersion};

pub use catchup::{catchup, full_resync, Catchup, RowRef};
pub use updater::{prune_history, ConfigChanges, ConfigUpdater, QueryChanges, QueryUpdater};

/// Per-client state: the hashes of the queries it desires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub desired_query_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub ast: Ast,
    /// Client id to the version at which it started desiring the query.
    pub desired_by: BTreeMap<String, CvrVersion>,
    /// Version at which the query joined the got set. Never regresses.
    #[serde(default)]
    pub got_version: Option<CvrVersion>,
    /// Hash of the normalized AST; pipelines are shared on it.
    #[serde(default)]
    pub transformation_hash: Option<String>,
}

impl QueryRecord {
    #[must_use]
    pub fn new(ast: Ast) -> Self {
        Self {
            ast,
            desired_by: BTreeMap::new(),
            got_version: None,
            transformation_hash: None,
        }
    }
}

/// A row the group has been sent, or a tombstone for one it no longer has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    pub table_name: String,
    /// Primary-key columns and values.
    pub id: Row,
    /// Content hash of the row as last sent.
    pub row_version: String,
    pub patch_version: CvrVersion,
    /// Query hash to number of occurrences. `None` marks a tombstone.
    pub ref_counts: Option<BTreeMap<String, u32>>,
}

impl RowRecord {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvrRecord {
    pub id: String,
    pub version: CvrVersion,
    /// Milliseconds since the epoch of the last flush.
    pub last_active: u64,
    /// Replica watermark the rows were last computed at.
    #[serde(default)]
    pub replica_version: Option<String>,
    pub clients: BTreeMap<String, ClientRecord>,
    pub queries: BTreeMap<String, QueryRecord>,
    /// Keyed by [`row_key_string`].
    pub rows: BTreeMap<String, RowRecord>,
    /// Oldest cookie that can still be caught up incrementally.
    pub history_floor: CvrVersion,
    /// Client id to query hash to the version the client stopped desiring it.
    #[serde(default)]
    pub desire_tombstones: BTreeMap<String, BTreeMap<String, CvrVersion>>,
    /// Query hash to the version it left the got set.
    #[serde(default)]
    pub query_tombstones: BTreeMap<String, CvrVersion>,
}

impl CvrRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            version: CvrVersion::initial(),
            last_active: now,
            replica_version: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            rows: BTreeMap::new(),
            history_floor: CvrVersion::initial(),
            desire_tombstones: BTreeMap::new(),
            query_tombstones: BTreeMap::new(),
        }
    }

    /// Queries that are in the got set.
    pub fn got_queries(&self) -> impl Iterator<Item = (&String, &QueryRecord)> {
        self.queries.iter().filter(|(_, q)| q.got_version.is_some())
    }

    /// Number of rows currently referenced by at least one query.
    #[must_use]
    pub fn live_row_count(&self) -> usize {
        self.rows.values().filter(|r| !r.is_tombstone()).count()
    }

    /// Version a replica advance moves this record to: the replica's version
    /// when it is ahead, otherwise the next minor version.
    #[must_use]
    pub fn next_version_for(&self, replica_version: &str) -> CvrVersion {
        let candidate = CvrVersion::new(replica_version);
        if candidate > self.version {
            candidate
        } else {
            self.version.bump_minor()
        }
    }
}

/// A change in how often a query references a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDelta {
    pub query_hash: String,
    pub table: String,
    pub id: Row,
    /// Row contents as of the change.
    pub row: Row,
    pub delta: i64,
}

/// Map key of a row record.
#[must_use]
pub fn row_key_string(table: &str, id: &Row) -> String {
    let id = serde_json::to_string(id).unwrap_or_default();
    format!("{table}\u{0}{id}")
}

/// Content hash used to detect rows that changed since they were sent.
#[must_use]
pub fn row_version(row: &Row) -> String {
    let json = serde_json::to_string(row).unwrap_or_default();
    format!("{:08x}", fnv1a_hash(&json))
}
