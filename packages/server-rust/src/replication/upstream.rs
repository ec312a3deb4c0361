//! In-memory upstream database.
//!
//! Stands in for the upstream Postgres: it owns the authoritative tables,
//! turns CRUD mutation batches into replication transactions with
//! increasing LSNs, and feeds them to the change streamer. Each batch also
//! upserts the pushing clients' rows in the `_clients` table.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use viewsync_core::data::{row_key, Row, RowKey};
use viewsync_core::messages::{CrudKind, Mutation};
use viewsync_core::version::{format_lsn, version_from_lexi};
use viewsync_core::Value;

use super::event::{ChangeSourceEvent, CLIENTS_TABLE};
use super::streamer::{ChangeStreamer, Transaction};
use crate::storage::ReplicaSnapshot;

/// Receives mutations a client group pushed.
///
/// Used as `Arc<dyn MutationSink>`.
#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Applies `mutations` in order as one upstream transaction.
    async fn apply(&self, client_group_id: &str, mutations: &[Mutation]) -> anyhow::Result<()>;
}

struct Table {
    primary_key: Vec<String>,
    rows: BTreeMap<RowKey, Row>,
}

struct State {
    next_lsn: u64,
    tables: BTreeMap<String, Table>,
}

pub struct MemoryUpstream {
    streamer: Arc<ChangeStreamer>,
    state: Mutex<State>,
}

impl MemoryUpstream {
    #[must_use]
    pub fn new(streamer: Arc<ChangeStreamer>) -> Self {
        Self {
            streamer,
            state: Mutex::new(State {
                next_lsn: 1,
                tables: BTreeMap::new(),
            }),
        }
    }

    /// Starts from the replica's contents, with LSNs continuing after its
    /// watermark.
    ///
    /// # Errors
    ///
    /// The snapshot's watermark is not a lexi version.
    pub fn seeded(streamer: Arc<ChangeStreamer>, snapshot: &ReplicaSnapshot) -> anyhow::Result<Self> {
        let upstream = Self::new(streamer);
        {
            let mut state = upstream.state.lock();
            if let Some(watermark) = &snapshot.watermark {
                state.next_lsn = version_from_lexi(watermark)? + 1;
            }
            for (spec, rows) in &snapshot.tables {
                let table = Table {
                    primary_key: spec.primary_key.clone(),
                    rows: rows
                        .iter()
                        .map(|row| (row_key(row, &spec.primary_key), row.clone()))
                        .collect(),
                };
                state.tables.insert(spec.name.clone(), table);
            }
        }
        Ok(upstream)
    }

    /// Commits `events` as one transaction, bypassing mutation handling.
    ///
    /// # Errors
    ///
    /// The streamer rejects the transaction.
    pub fn commit(&self, events: Vec<ChangeSourceEvent>) -> anyhow::Result<Arc<Transaction>> {
        let mut state = self.state.lock();
        for event in &events {
            track(&mut state.tables, event);
        }
        self.emit(&mut state, events)
    }

    fn emit(
        &self,
        state: &mut State,
        events: Vec<ChangeSourceEvent>,
    ) -> anyhow::Result<Arc<Transaction>> {
        let begin = state.next_lsn;
        let commit = begin + 1;
        state.next_lsn = commit + 1;
        self.streamer.process(ChangeSourceEvent::Begin {
            lsn: format_lsn(begin),
        })?;
        for event in events {
            self.streamer.process(event)?;
        }
        self.streamer
            .process(ChangeSourceEvent::Commit {
                lsn: format_lsn(commit),
            })?
            .ok_or_else(|| anyhow!("commit did not complete a transaction"))
    }
}

/// Keeps the upstream's own tables in step with raw events.
fn track(tables: &mut BTreeMap<String, Table>, event: &ChangeSourceEvent) {
    match event {
        ChangeSourceEvent::Insert { table, row } | ChangeSourceEvent::Update { table, row, .. } => {
            let entry = tables.entry(table.clone()).or_insert_with(|| Table {
                primary_key: vec!["id".into()],
                rows: BTreeMap::new(),
            });
            if let ChangeSourceEvent::Update {
                old_key: Some(old), ..
            } = event
            {
                let old = row_key(old, &entry.primary_key);
                entry.rows.remove(&old);
            }
            entry
                .rows
                .insert(row_key(row, &entry.primary_key), row.clone());
        }
        ChangeSourceEvent::Delete { table, key } => {
            if let Some(entry) = tables.get_mut(table) {
                let key = row_key(key, &entry.primary_key);
                entry.rows.remove(&key);
            }
        }
        ChangeSourceEvent::Truncate { tables: names } => {
            for name in names {
                if let Some(entry) = tables.get_mut(name) {
                    entry.rows.clear();
                }
            }
        }
        ChangeSourceEvent::Begin { .. } | ChangeSourceEvent::Commit { .. } => {}
    }
}

#[async_trait]
impl MutationSink for MemoryUpstream {
    async fn apply(&self, client_group_id: &str, mutations: &[Mutation]) -> anyhow::Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut events = Vec::new();
        let mut last_ids: BTreeMap<&str, u64> = BTreeMap::new();

        for mutation in mutations {
            let Some(args) = mutation.crud_args() else {
                bail!("mutation {} is not a CRUD mutation", mutation.name);
            };
            for op in args.ops {
                let table = state.tables.entry(op.table_name.clone()).or_insert_with(|| Table {
                    primary_key: op.primary_key.clone(),
                    rows: BTreeMap::new(),
                });
                let key = row_key(&op.value, &op.primary_key);
                let existing = table.rows.get(&key).cloned();
                let event = match (op.op, existing) {
                    (CrudKind::Create, Some(_)) | (CrudKind::Update | CrudKind::Delete, None) => {
                        None
                    }
                    (CrudKind::Create | CrudKind::Set, _) => Some(ChangeSourceEvent::Insert {
                        table: op.table_name.clone(),
                        row: op.value.clone(),
                    }),
                    (CrudKind::Update, Some(mut row)) => {
                        row.extend(op.value.clone());
                        Some(ChangeSourceEvent::Update {
                            table: op.table_name.clone(),
                            old_key: None,
                            row,
                        })
                    }
                    (CrudKind::Delete, Some(_)) => Some(ChangeSourceEvent::Delete {
                        table: op.table_name.clone(),
                        key: op
                            .primary_key
                            .iter()
                            .filter_map(|c| Some((c.clone(), op.value.get(c)?.clone())))
                            .collect(),
                    }),
                };
                if let Some(event) = event {
                    track(&mut state.tables, &event);
                    events.push(event);
                }
            }
            let last = last_ids.entry(mutation.client_id.as_str()).or_default();
            *last = (*last).max(mutation.id);
        }

        for (client_id, last) in last_ids {
            let row: Row = [
                ("clientGroupID".to_string(), Value::from(client_group_id)),
                ("clientID".to_string(), Value::from(client_id)),
                (
                    "lastMutationID".to_string(),
                    Value::Int(i64::try_from(last).unwrap_or(i64::MAX)),
                ),
            ]
            .into_iter()
            .collect();
            let event = ChangeSourceEvent::Insert {
                table: CLIENTS_TABLE.to_string(),
                row,
            };
            state
                .tables
                .entry(CLIENTS_TABLE.to_string())
                .or_insert_with(|| Table {
                    primary_key: vec!["clientGroupID".into(), "clientID".into()],
                    rows: BTreeMap::new(),
                });
            track(&mut state.tables, &event);
            events.push(event);
        }

        let txn = self.emit(&mut state, events)?;
        debug!(
            client_group = %client_group_id,
            mutations = mutations.len(),
            watermark = %txn.watermark,
            "applied pushed mutations"
        );
        Ok(())
    }
}

/// Mutation sink for replicas fed by an external upstream: pushes are
/// refused because nothing here can write to that upstream.
#[derive(Debug, Default)]
pub struct ReadOnlyUpstream;

#[async_trait]
impl MutationSink for ReadOnlyUpstream {
    async fn apply(&self, client_group_id: &str, mutations: &[Mutation]) -> anyhow::Result<()> {
        bail!(
            "client group {client_group_id} pushed {} mutations but the upstream is read-only",
            mutations.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::event::{DataChange, Publications};
    use viewsync_core::data::make_row;
    use viewsync_core::messages::CRUD_MUTATION_NAME;

    fn crud(id: u64, ops: serde_json::Value) -> Mutation {
        Mutation {
            id,
            client_id: "c1".into(),
            name: CRUD_MUTATION_NAME.into(),
            args: serde_json::json!({ "ops": ops }),
            timestamp: 0,
        }
    }

    fn setup() -> (Arc<ChangeStreamer>, MemoryUpstream) {
        let streamer = Arc::new(ChangeStreamer::new(Publications::default(), 16));
        let upstream = MemoryUpstream::new(Arc::clone(&streamer));
        (streamer, upstream)
    }

    #[tokio::test]
    async fn crud_batch_becomes_one_transaction() {
        let (streamer, upstream) = setup();
        let mut sub = streamer.subscribe(None).unwrap();
        upstream
            .apply(
                "g1",
                &[
                    crud(
                        1,
                        serde_json::json!([
                            {"op": "create", "tableName": "issue", "primaryKey": ["id"], "value": {"id": 1, "title": "a"}}
                        ]),
                    ),
                    crud(
                        2,
                        serde_json::json!([
                            {"op": "update", "tableName": "issue", "primaryKey": ["id"], "value": {"id": 1, "title": "b"}},
                            {"op": "update", "tableName": "issue", "primaryKey": ["id"], "value": {"id": 9, "title": "z"}}
                        ]),
                    ),
                ],
            )
            .await
            .unwrap();

        let txn = sub.rx.recv().await.unwrap();
        assert_eq!(txn.changes.len(), 3);
        assert!(matches!(
            &txn.changes[1],
            DataChange::Update { row, .. } if row["title"] == Value::from("b")
        ));
        let DataChange::Insert { table, row } = &txn.changes[2] else {
            panic!("expected the _clients upsert");
        };
        assert_eq!(table, CLIENTS_TABLE);
        assert_eq!(row["lastMutationID"], Value::from(2));
    }

    #[tokio::test]
    async fn create_is_a_noop_for_existing_rows_and_delete_uses_the_key() {
        let (streamer, upstream) = setup();
        upstream
            .commit(vec![ChangeSourceEvent::Insert {
                table: "issue".into(),
                row: make_row([("id", 1)]),
            }])
            .unwrap();
        let mut sub = streamer.subscribe(streamer.watermark().as_deref()).unwrap();
        upstream
            .apply(
                "g1",
                &[crud(
                    1,
                    serde_json::json!([
                        {"op": "create", "tableName": "issue", "primaryKey": ["id"], "value": {"id": 1, "title": "dup"}},
                        {"op": "delete", "tableName": "issue", "primaryKey": ["id"], "value": {"id": 1}}
                    ]),
                )],
            )
            .await
            .unwrap();
        let txn = sub.rx.recv().await.unwrap();
        assert_eq!(
            txn.changes[0],
            DataChange::Delete {
                table: "issue".into(),
                key: make_row([("id", 1)])
            }
        );
    }

    #[tokio::test]
    async fn custom_mutations_are_refused() {
        let (_, upstream) = setup();
        let mutation = Mutation {
            id: 1,
            client_id: "c1".into(),
            name: "createIssue".into(),
            args: serde_json::Value::Null,
            timestamp: 0,
        };
        assert!(upstream.apply("g1", &[mutation]).await.is_err());
    }

    #[tokio::test]
    async fn read_only_upstream_refuses_pushes() {
        let err = ReadOnlyUpstream
            .apply("g1", &[crud(1, serde_json::json!([]))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
