//! CVR updaters.
//!
//! [`ConfigUpdater`] applies desired-query changes from clients and bumps the
//! minor version once per flush. [`QueryUpdater`] records what pipelines
//! produced at a given version and yields the row and got-query patches for
//! the group.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use viewsync_core::data::Row;
use viewsync_core::messages::{QueryPatchOp, RowPatchOp};
use viewsync_core::multiset::{normalize, Entry};
use viewsync_core::{Ast, CvrVersion};

use super::{row_key_string, row_version, ClientRecord, CvrRecord, QueryRecord, RowDelta, RowRecord};

// ---------------------------------------------------------------------------
// Config-driven updates
// ---------------------------------------------------------------------------

/// Outcome of a [`ConfigUpdater`] flush.
#[derive(Debug, Default)]
pub struct ConfigChanges {
    /// New record version, `None` when nothing changed.
    pub version: Option<CvrVersion>,
    pub desired_patches: BTreeMap<String, Vec<QueryPatchOp>>,
    /// Queries that gained their first desirer.
    pub added: Vec<(String, Ast)>,
    /// Queries no client desires anymore.
    pub removed: Vec<String>,
}

pub struct ConfigUpdater<'a> {
    record: &'a mut CvrRecord,
    next: Option<CvrVersion>,
    desired_patches: BTreeMap<String, Vec<QueryPatchOp>>,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl<'a> ConfigUpdater<'a> {
    pub fn new(record: &'a mut CvrRecord) -> Self {
        Self {
            record,
            next: None,
            desired_patches: BTreeMap::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    fn version(&mut self) -> CvrVersion {
        let record = &*self.record;
        self.next
            .get_or_insert_with(|| record.version.bump_minor())
            .clone()
    }

    /// Registers `client_id` with the group. Returns `true` if it was new.
    pub fn ensure_client(&mut self, client_id: &str) -> bool {
        if self.record.clients.contains_key(client_id) {
            return false;
        }
        self.record
            .clients
            .insert(client_id.to_string(), ClientRecord::default());
        true
    }

    pub fn put_desired_queries(&mut self, client_id: &str, queries: Vec<(String, Ast)>) {
        self.ensure_client(client_id);
        for (hash, ast) in queries {
            let already = self
                .record
                .clients
                .get(client_id)
                .is_some_and(|c| c.desired_query_ids.contains(&hash));
            if already {
                continue;
            }
            let version = self.version();
            if let Some(client) = self.record.clients.get_mut(client_id) {
                client.desired_query_ids.insert(hash.clone());
            }
            if let Some(tombstones) = self.record.desire_tombstones.get_mut(client_id) {
                tombstones.remove(&hash);
            }
            // Orphaned and re-desired within one flush: nothing to tear down.
            self.removed.remove(&hash);
            let query = self.record.queries.entry(hash.clone()).or_insert_with(|| {
                self.added.insert(hash.clone());
                QueryRecord::new(ast.clone())
            });
            query.desired_by.insert(client_id.to_string(), version);
            self.desired_patches
                .entry(client_id.to_string())
                .or_default()
                .push(QueryPatchOp::put(hash, ast));
        }
    }

    pub fn delete_desired_queries(&mut self, client_id: &str, hashes: &[String]) {
        for hash in hashes {
            let desired = self
                .record
                .clients
                .get(client_id)
                .is_some_and(|c| c.desired_query_ids.contains(hash));
            if !desired {
                continue;
            }
            let version = self.version();
            if let Some(client) = self.record.clients.get_mut(client_id) {
                client.desired_query_ids.remove(hash);
            }
            self.record
                .desire_tombstones
                .entry(client_id.to_string())
                .or_default()
                .insert(hash.clone(), version);
            self.desired_patches
                .entry(client_id.to_string())
                .or_default()
                .push(QueryPatchOp::del(hash.clone()));

            let orphaned = match self.record.queries.get_mut(hash) {
                Some(query) => {
                    query.desired_by.remove(client_id);
                    query.desired_by.is_empty()
                }
                None => false,
            };
            if orphaned {
                if self.added.remove(hash) {
                    // Never executed, so there is nothing to retract.
                    self.record.queries.remove(hash);
                } else {
                    self.removed.insert(hash.clone());
                }
            }
        }
    }

    pub fn clear_desired_queries(&mut self, client_id: &str) {
        let hashes: Vec<String> = self
            .record
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.delete_desired_queries(client_id, &hashes);
    }

    /// Applies the new version to the record and returns what changed.
    #[must_use]
    pub fn flush(self) -> ConfigChanges {
        let Some(version) = self.next else {
            return ConfigChanges::default();
        };
        self.record.version = version.clone();
        let added = self
            .added
            .into_iter()
            .filter_map(|hash| {
                let ast = self.record.queries.get(&hash)?.ast.clone();
                Some((hash, ast))
            })
            .collect();
        ConfigChanges {
            version: Some(version),
            desired_patches: self.desired_patches,
            added,
            removed: self.removed.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query-driven updates
// ---------------------------------------------------------------------------

/// Patches produced by a [`QueryUpdater`].
#[derive(Debug, Default)]
pub struct QueryChanges {
    pub got_patch: Vec<QueryPatchOp>,
    pub rows_patch: Vec<RowPatchOp>,
}

impl QueryChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.got_patch.is_empty() && self.rows_patch.is_empty()
    }
}

pub struct QueryUpdater<'a> {
    record: &'a mut CvrRecord,
    version: CvrVersion,
    changes: QueryChanges,
}

impl<'a> QueryUpdater<'a> {
    /// All patches are stamped with `version`, which must not be older than
    /// the record's.
    pub fn new(record: &'a mut CvrRecord, version: CvrVersion) -> Self {
        Self {
            record,
            version,
            changes: QueryChanges::default(),
        }
    }

    /// Marks `hash` as executed. The first execution emits a got-query put.
    pub fn track_executed(&mut self, hash: &str, transformation_hash: &str) {
        let Some(query) = self.record.queries.get_mut(hash) else {
            return;
        };
        query.transformation_hash = Some(transformation_hash.to_string());
        if query.got_version.is_none() {
            query.got_version = Some(self.version.clone());
            self.record.query_tombstones.remove(hash);
            self.changes
                .got_patch
                .push(QueryPatchOp::put(hash, query.ast.clone()));
        }
    }

    /// Merges reference-count changes for rows. Opposite deltas of one row
    /// and query cancel before anything is applied.
    pub fn received(&mut self, deltas: impl IntoIterator<Item = RowDelta>) {
        // (table, id, latest contents) per row key.
        let mut seen: BTreeMap<String, (String, Row, Option<Row>)> = BTreeMap::new();
        let mut entries = Vec::new();
        for delta in deltas {
            let key = row_key_string(&delta.table, &delta.id);
            let row = seen
                .entry(key.clone())
                .or_insert_with(|| (delta.table.clone(), delta.id.clone(), None));
            // Removals carry no usable contents.
            if delta.delta >= 0 && !delta.row.is_empty() {
                row.2 = Some(delta.row);
            }
            entries.push(Entry::new((key, delta.query_hash), delta.delta));
        }

        let mut counts: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        for entry in normalize(entries, |k| k.clone()) {
            let (key, hash) = entry.value;
            counts.entry(key).or_default().insert(hash, entry.multiplicity);
        }
        // Rows whose counts cancelled still have their contents compared.
        for (key, (table, id, contents)) in seen {
            let deltas = counts.remove(&key).unwrap_or_default();
            self.apply_row(key, table, id, contents, &deltas);
        }
    }

    fn apply_row(
        &mut self,
        key: String,
        table: String,
        id: Row,
        contents: Option<Row>,
        deltas: &BTreeMap<String, i64>,
    ) {
        let existing = self.record.rows.get(&key);
        let was_live = existing.is_some_and(|r| !r.is_tombstone());
        let mut counts = existing
            .and_then(|r| r.ref_counts.clone())
            .unwrap_or_default();
        for (hash, delta) in deltas {
            let current = i64::from(counts.get(hash).copied().unwrap_or(0));
            let next = current + delta;
            if next > 0 {
                counts.insert(hash.clone(), u32::try_from(next).unwrap_or(u32::MAX));
            } else {
                if next < 0 {
                    debug!(row = %key, query = %hash, "ref count went negative, clamping");
                }
                counts.remove(hash);
            }
        }

        if counts.is_empty() {
            if was_live {
                if let Some(record) = self.record.rows.get_mut(&key) {
                    record.ref_counts = None;
                    record.patch_version = self.version.clone();
                }
                self.changes.rows_patch.push(RowPatchOp::Del {
                    table_name: table,
                    id,
                });
            }
            return;
        }

        let new_version = contents.as_ref().map(row_version);
        let changed = match (&new_version, self.record.rows.get(&key)) {
            (Some(v), Some(r)) => &r.row_version != v,
            _ => false,
        };
        if !was_live || changed {
            let Some(value) = contents else {
                // Gaining references without contents cannot happen for a
                // row that is not live: additions always carry the row.
                debug!(row = %key, "row gained references without contents");
                return;
            };
            self.record.rows.insert(
                key,
                RowRecord {
                    table_name: table.clone(),
                    id,
                    row_version: new_version.unwrap_or_default(),
                    patch_version: self.version.clone(),
                    ref_counts: Some(counts),
                },
            );
            self.changes.rows_patch.push(RowPatchOp::Put {
                table_name: table,
                value,
            });
        } else if let Some(record) = self.record.rows.get_mut(&key) {
            record.ref_counts = Some(counts);
        }
    }

    /// Sets the rows referenced by `hash` to exactly `rows`, as after a
    /// rehydration. Rows whose count is unchanged still have their contents
    /// compared, so edits missed while the pipeline was down are sent.
    pub fn replace_query_rows(&mut self, hash: &str, rows: Vec<RowDelta>) {
        let entries = rows.into_iter().map(|row| {
            let multiplicity = row.delta;
            Entry::new(row, multiplicity)
        });
        let target: BTreeMap<String, Entry<RowDelta>> =
            normalize(entries, |row| row_key_string(&row.table, &row.id))
                .into_iter()
                .map(|e| (row_key_string(&e.value.table, &e.value.id), e))
                .collect();

        let current = |record: &RowRecord| {
            record
                .ref_counts
                .as_ref()
                .and_then(|c| c.get(hash))
                .copied()
                .map_or(0, i64::from)
        };

        let mut deltas = Vec::new();
        for (key, record) in &self.record.rows {
            let held = current(record);
            if held > 0 && !target.contains_key(key) {
                deltas.push(RowDelta {
                    query_hash: hash.to_string(),
                    table: record.table_name.clone(),
                    id: record.id.clone(),
                    row: Row::new(),
                    delta: -held,
                });
            }
        }
        for (key, entry) in target {
            let held = self.record.rows.get(&key).map_or(0, current);
            deltas.push(RowDelta {
                query_hash: hash.to_string(),
                delta: entry.multiplicity - held,
                ..entry.value
            });
        }
        self.received(deltas);
    }

    /// Drops every reference `hash` holds and removes it from the got set.
    pub fn remove_query(&mut self, hash: &str) {
        let deltas: Vec<RowDelta> = self
            .record
            .rows
            .values()
            .filter_map(|r| {
                let n = *r.ref_counts.as_ref()?.get(hash)?;
                Some(RowDelta {
                    query_hash: hash.to_string(),
                    table: r.table_name.clone(),
                    id: r.id.clone(),
                    row: Row::new(),
                    delta: -i64::from(n),
                })
            })
            .collect();
        self.received(deltas);

        let orphaned = self
            .record
            .queries
            .get(hash)
            .is_some_and(|q| q.desired_by.is_empty());
        if orphaned {
            if let Some(query) = self.record.queries.remove(hash) {
                if query.got_version.is_some() {
                    self.record
                        .query_tombstones
                        .insert(hash.to_string(), self.version.clone());
                    self.changes.got_patch.push(QueryPatchOp::del(hash));
                }
            }
        }
    }

    /// Moves the record to the updater's version when anything changed.
    #[must_use]
    pub fn flush(self) -> QueryChanges {
        if !self.changes.is_empty() && self.version > self.record.version {
            self.record.version = self.version;
        }
        self.changes
    }
}

// ---------------------------------------------------------------------------
// History pruning
// ---------------------------------------------------------------------------

/// Keeps at most `max_row_history` row tombstones. Pruned entries raise the
/// history floor, so cookies older than the newest pruned tombstone can no
/// longer be caught up incrementally. Returns the number of pruned rows.
pub fn prune_history(record: &mut CvrRecord, max_row_history: usize) -> usize {
    let mut tombstones: Vec<(CvrVersion, String)> = record
        .rows
        .iter()
        .filter(|(_, r)| r.is_tombstone())
        .map(|(k, r)| (r.patch_version.clone(), k.clone()))
        .collect();
    if tombstones.len() <= max_row_history {
        return 0;
    }
    tombstones.sort();
    let excess = tombstones.len() - max_row_history;
    let mut floor = record.history_floor.clone();
    for (version, key) in tombstones.into_iter().take(excess) {
        record.rows.remove(&key);
        if version > floor {
            floor = version;
        }
    }
    record.history_floor = floor.clone();
    record.query_tombstones.retain(|_, v| *v > floor);
    for tombstones in record.desire_tombstones.values_mut() {
        tombstones.retain(|_, v| *v > floor);
    }
    record.desire_tombstones.retain(|_, t| !t.is_empty());
    debug!(client_group = %record.id, pruned = excess, floor = %record.history_floor, "pruned row history");
    excess
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewsync_core::data::make_row;

    fn delta(hash: &str, id: i64, title: &str, d: i64) -> RowDelta {
        RowDelta {
            query_hash: hash.into(),
            table: "issue".into(),
            id: make_row([("id", id)]),
            row: make_row([("id", viewsync_core::Value::from(id)), ("title", title.into())]),
            delta: d,
        }
    }

    fn desired(record: &mut CvrRecord, client: &str, hash: &str) -> ConfigChanges {
        let mut updater = ConfigUpdater::new(record);
        updater.put_desired_queries(client, vec![(hash.into(), Ast::table("issue"))]);
        updater.flush()
    }

    #[test]
    fn config_updates_bump_minor_once() {
        let mut record = CvrRecord::new("g", 0);
        let mut updater = ConfigUpdater::new(&mut record);
        updater.put_desired_queries(
            "c1",
            vec![
                ("q1".into(), Ast::table("issue")),
                ("q2".into(), Ast::table("user")),
            ],
        );
        let changes = updater.flush();
        assert_eq!(changes.version, Some(CvrVersion::initial().bump_minor()));
        assert_eq!(changes.added.len(), 2);
        assert_eq!(changes.desired_patches["c1"].len(), 2);
        assert_eq!(record.version, CvrVersion::initial().bump_minor());

        // Re-desiring is a no-op and does not bump.
        let again = desired(&mut record, "c1", "q1");
        assert!(again.version.is_none());
    }

    #[test]
    fn query_is_removed_when_last_desirer_leaves() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        desired(&mut record, "c2", "q1");
        record.queries.get_mut("q1").unwrap().got_version = Some(record.version.clone());

        let mut updater = ConfigUpdater::new(&mut record);
        updater.delete_desired_queries("c1", &["q1".into()]);
        let changes = updater.flush();
        assert!(changes.removed.is_empty());

        let mut updater = ConfigUpdater::new(&mut record);
        updater.clear_desired_queries("c2");
        let changes = updater.flush();
        assert_eq!(changes.removed, vec!["q1".to_string()]);
        assert_eq!(
            changes.desired_patches["c2"],
            vec![QueryPatchOp::del("q1")]
        );
        assert!(record.desire_tombstones["c2"].contains_key("q1"));
    }

    #[test]
    fn added_then_deleted_in_one_flush_leaves_nothing() {
        let mut record = CvrRecord::new("g", 0);
        let mut updater = ConfigUpdater::new(&mut record);
        updater.put_desired_queries("c1", vec![("q1".into(), Ast::table("issue"))]);
        updater.delete_desired_queries("c1", &["q1".into()]);
        let changes = updater.flush();
        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert!(record.queries.is_empty());
    }

    #[test]
    fn rows_are_ref_counted_across_queries() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        desired(&mut record, "c1", "q2");

        let v1 = CvrVersion::new("05");
        let mut updater = QueryUpdater::new(&mut record, v1.clone());
        updater.track_executed("q1", "t1");
        updater.received([delta("q1", 1, "a", 1), delta("q1", 2, "b", 1)]);
        let changes = updater.flush();
        assert_eq!(changes.got_patch.len(), 1);
        assert_eq!(changes.rows_patch.len(), 2);
        assert_eq!(record.version, v1);

        let v2 = CvrVersion::new("06");
        let mut updater = QueryUpdater::new(&mut record, v2);
        updater.track_executed("q2", "t2");
        updater.received([delta("q2", 1, "a", 1)]);
        let changes = updater.flush();
        // Row 1 was already sent with the same contents.
        assert!(changes.rows_patch.is_empty());

        let v3 = CvrVersion::new("07");
        let mut updater = QueryUpdater::new(&mut record, v3.clone());
        updater.remove_query("q1");
        let changes = updater.flush();
        // Row 2 lost its only reference; row 1 is still held by q2.
        assert_eq!(
            changes.rows_patch,
            vec![RowPatchOp::Del {
                table_name: "issue".into(),
                id: make_row([("id", 2)])
            }]
        );
        let key = row_key_string("issue", &make_row([("id", 2)]));
        assert!(record.rows[&key].is_tombstone());
        assert_eq!(record.rows[&key].patch_version, v3);
    }

    #[test]
    fn edits_emit_puts() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("05"));
        updater.received([delta("q1", 1, "a", 1)]);
        let _ = updater.flush();

        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("06"));
        updater.received([delta("q1", 1, "a", -1), delta("q1", 1, "z", 1)]);
        let changes = updater.flush();
        assert_eq!(
            changes.rows_patch,
            vec![RowPatchOp::Put {
                table_name: "issue".into(),
                value: delta("q1", 1, "z", 1).row
            }]
        );
    }

    #[test]
    fn opposite_deltas_in_one_batch_cancel() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        desired(&mut record, "c1", "q2");
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("05"));
        updater.received([
            delta("q1", 1, "a", 1),
            delta("q1", 3, "c", 1),
            delta("q1", 3, "c", -1),
        ]);
        let changes = updater.flush();
        // Row 3 came and went without ever reaching the client.
        assert_eq!(changes.rows_patch.len(), 1);
        assert!(!record.rows.contains_key(&row_key_string("issue", &make_row([("id", 3)]))));

        // The reference moves from q1 to q2; the row stays live throughout.
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("06"));
        updater.received([delta("q1", 1, "a", -1), delta("q2", 1, "a", 1)]);
        let changes = updater.flush();
        assert!(changes.rows_patch.is_empty());
        let key = row_key_string("issue", &make_row([("id", 1)]));
        let counts = record.rows[&key].ref_counts.clone().unwrap();
        assert_eq!(counts.get("q2"), Some(&1));
        assert!(!counts.contains_key("q1"));
    }

    #[test]
    fn got_version_never_regresses() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("07"));
        updater.track_executed("q1", "t");
        let _ = updater.flush();
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("08"));
        updater.track_executed("q1", "t");
        let changes = updater.flush();
        assert!(changes.got_patch.is_empty());
        assert_eq!(record.queries["q1"].got_version, Some(CvrVersion::new("07")));
    }

    #[test]
    fn replace_rows_diffs_against_current() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("05"));
        updater.received([delta("q1", 1, "a", 1), delta("q1", 2, "b", 1)]);
        let _ = updater.flush();

        let mut updater = QueryUpdater::new(&mut record, CvrVersion::new("06"));
        updater.replace_query_rows("q1", vec![delta("q1", 2, "b2", 1), delta("q1", 3, "c", 1)]);
        let changes = updater.flush();
        let mut ops: Vec<String> = changes
            .rows_patch
            .iter()
            .map(|op| match op {
                RowPatchOp::Put { value, .. } => format!("put {}", value["id"]),
                RowPatchOp::Del { id, .. } => format!("del {}", id["id"]),
                _ => "other".into(),
            })
            .collect();
        ops.sort();
        assert_eq!(ops, vec!["del 1", "put 2", "put 3"]);
    }

    #[test]
    fn pruning_raises_floor() {
        let mut record = CvrRecord::new("g", 0);
        desired(&mut record, "c1", "q1");
        for (i, v) in ["05", "06", "07"].iter().enumerate() {
            let id = i64::try_from(i).unwrap();
            let mut updater = QueryUpdater::new(&mut record, CvrVersion::new(*v));
            updater.received([delta("q1", id, "x", 1)]);
            let _ = updater.flush();
        }
        for (i, v) in ["08", "09", "0a"].iter().enumerate() {
            let id = i64::try_from(i).unwrap();
            let mut updater = QueryUpdater::new(&mut record, CvrVersion::new(*v));
            updater.received([delta("q1", id, "x", -1)]);
            let _ = updater.flush();
        }
        assert_eq!(prune_history(&mut record, 1), 2);
        assert_eq!(record.history_floor, CvrVersion::new("09"));
        assert_eq!(record.rows.len(), 1);
    }
}
