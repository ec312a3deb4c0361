//! Catch-up from a cookie.
//!
//! Computes what a client at `base` is missing relative to the record. Rows
//! are returned as references; the caller supplies current contents.

use std::collections::BTreeMap;

use viewsync_core::data::Row;
use viewsync_core::messages::QueryPatchOp;
use viewsync_core::CvrVersion;

use super::CvrRecord;
use crate::error::SyncError;

/// A row the client must put or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRef {
    Put { table: String, id: Row },
    Del { table: String, id: Row },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catchup {
    /// Version the client is at once the patches are applied.
    pub version: CvrVersion,
    /// The client must drop its cached state before applying the patches.
    pub clear: bool,
    pub rows: Vec<RowRef>,
    pub got_patch: Vec<QueryPatchOp>,
    pub desired_patches: BTreeMap<String, Vec<QueryPatchOp>>,
}

/// Patches that move a client from `base` to the record's version.
///
/// # Errors
///
/// * [`SyncError::InvalidConnectionRequest`] if `base` is ahead of the record.
/// * [`SyncError::ReplicationGap`] if `base` predates the retained history;
///   answer it with [`full_resync`].
pub fn catchup(record: &CvrRecord, base: Option<&CvrVersion>) -> Result<Catchup, SyncError> {
    let Some(base) = base else {
        return Ok(full_resync(record, false));
    };
    if *base > record.version {
        return Err(SyncError::InvalidConnectionRequest(format!(
            "cookie {base} is ahead of client group {} at {}",
            record.id, record.version
        )));
    }
    if *base < record.history_floor {
        return Err(SyncError::ReplicationGap {
            base: base.clone(),
            floor: record.history_floor.clone(),
        });
    }

    let rows = record
        .rows
        .values()
        .filter(|r| r.patch_version > *base)
        .map(|r| {
            let table = r.table_name.clone();
            let id = r.id.clone();
            if r.is_tombstone() {
                RowRef::Del { table, id }
            } else {
                RowRef::Put { table, id }
            }
        })
        .collect();

    let mut got_patch: Vec<QueryPatchOp> = record
        .got_queries()
        .filter(|(_, q)| q.got_version.as_ref().is_some_and(|v| v > base))
        .map(|(hash, q)| QueryPatchOp::put(hash.clone(), q.ast.clone()))
        .collect();
    got_patch.extend(
        record
            .query_tombstones
            .iter()
            .filter(|(_, v)| *v > base)
            .map(|(hash, _)| QueryPatchOp::del(hash.clone())),
    );

    let mut desired_patches: BTreeMap<String, Vec<QueryPatchOp>> = BTreeMap::new();
    for (hash, query) in &record.queries {
        for (client, since) in &query.desired_by {
            if since > base {
                desired_patches
                    .entry(client.clone())
                    .or_default()
                    .push(QueryPatchOp::put(hash.clone(), query.ast.clone()));
            }
        }
    }
    for (client, tombstones) in &record.desire_tombstones {
        for (hash, at) in tombstones {
            if at > base {
                desired_patches
                    .entry(client.clone())
                    .or_default()
                    .push(QueryPatchOp::del(hash.clone()));
            }
        }
    }

    Ok(Catchup {
        version: record.version.clone(),
        clear: false,
        rows,
        got_patch,
        desired_patches,
    })
}

/// The whole record as patches. With `clear`, every patch list starts with a
/// clear op so a client holding stale state starts over.
#[must_use]
pub fn full_resync(record: &CvrRecord, clear: bool) -> Catchup {
    let rows = record
        .rows
        .values()
        .filter(|r| !r.is_tombstone())
        .map(|r| RowRef::Put {
            table: r.table_name.clone(),
            id: r.id.clone(),
        })
        .collect();

    let mut got_patch = Vec::new();
    if clear {
        got_patch.push(QueryPatchOp::Clear);
    }
    got_patch.extend(
        record
            .got_queries()
            .map(|(hash, q)| QueryPatchOp::put(hash.clone(), q.ast.clone())),
    );

    let mut desired_patches = BTreeMap::new();
    for (client_id, client) in &record.clients {
        let mut ops = Vec::new();
        if clear {
            ops.push(QueryPatchOp::Clear);
        }
        ops.extend(client.desired_query_ids.iter().filter_map(|hash| {
            let query = record.queries.get(hash)?;
            Some(QueryPatchOp::put(hash.clone(), query.ast.clone()))
        }));
        if !ops.is_empty() {
            desired_patches.insert(client_id.clone(), ops);
        }
    }

    Catchup {
        version: record.version.clone(),
        clear,
        rows,
        got_patch,
        desired_patches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvr::{prune_history, ConfigUpdater, QueryUpdater, RowDelta};
    use viewsync_core::data::make_row;
    use viewsync_core::Ast;

    fn issue(id: i64) -> RowDelta {
        RowDelta {
            query_hash: "q1".into(),
            table: "issue".into(),
            id: make_row([("id", id)]),
            row: make_row([("id", id)]),
            delta: 1,
        }
    }

    /// c1 desires q1 at 00:01; rows 1 and 2 arrive at 05; row 1 leaves at 06.
    fn history() -> CvrRecord {
        let mut record = CvrRecord::new("g", 0);
        let mut config = ConfigUpdater::new(&mut record);
        config.put_desired_queries("c1", vec![("q1".into(), Ast::table("issue"))]);
        let _ = config.flush();

        let mut q = QueryUpdater::new(&mut record, CvrVersion::new("05"));
        q.track_executed("q1", "t1");
        q.received([issue(1), issue(2)]);
        let _ = q.flush();

        let mut q = QueryUpdater::new(&mut record, CvrVersion::new("06"));
        q.received([RowDelta {
            delta: -1,
            row: Row::new(),
            ..issue(1)
        }]);
        let _ = q.flush();
        record
    }

    #[test]
    fn no_cookie_is_a_full_result_without_clear() {
        let record = history();
        let result = catchup(&record, None).unwrap();
        assert!(!result.clear);
        assert_eq!(
            result.rows,
            vec![RowRef::Put {
                table: "issue".into(),
                id: make_row([("id", 2)])
            }]
        );
        assert_eq!(result.got_patch.len(), 1);
        assert_eq!(result.desired_patches["c1"].len(), 1);
    }

    #[test]
    fn incremental_sends_only_newer_entries() {
        let record = history();
        let result = catchup(&record, Some(&CvrVersion::new("05"))).unwrap();
        assert_eq!(
            result.rows,
            vec![RowRef::Del {
                table: "issue".into(),
                id: make_row([("id", 1)])
            }]
        );
        assert!(result.got_patch.is_empty());
        assert!(result.desired_patches.is_empty());
        assert_eq!(result.version, CvrVersion::new("06"));

        let current = catchup(&record, Some(&record.version)).unwrap();
        assert!(current.rows.is_empty());
    }

    #[test]
    fn cookie_from_the_future_is_rejected() {
        let record = history();
        let err = catchup(&record, Some(&CvrVersion::new("09"))).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConnectionRequest(_)));
    }

    #[test]
    fn pruned_history_needs_a_resync() {
        let mut record = history();
        prune_history(&mut record, 0);
        let err = catchup(&record, Some(&CvrVersion::new("05"))).unwrap_err();
        assert!(matches!(err, SyncError::ReplicationGap { .. }));

        let resync = full_resync(&record, true);
        assert!(resync.clear);
        assert_eq!(resync.got_patch[0], QueryPatchOp::Clear);
        assert_eq!(resync.desired_patches["c1"][0], QueryPatchOp::Clear);
        assert_eq!(resync.rows.len(), 1);
    }
}
