//! Replicator: applies committed transactions to the replica.
//!
//! Each transaction is resolved against the replica into concrete row
//! changes carrying full old rows, written in one batch together with its
//! watermark, and then published to view syncers. Transactions at or below
//! the replica's watermark are skipped, which makes redelivery harmless.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use viewsync_core::data::{row_key, Row, RowKey};
use viewsync_core::TableSpec;

use super::event::{DataChange, CLIENTS_TABLE};
use super::streamer::{ChangeStreamer, Transaction};
use crate::error::ReplicationError;
use crate::metrics::TRANSACTIONS_APPLIED_TOTAL;
use crate::storage::{ReplicaBatch, ReplicaStore, RowWrite};

/// A resolved change to one replica row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    Add { table: String, row: Row },
    Edit { table: String, old: Row, new: Row },
    Remove { table: String, row: Row },
}

impl RowChange {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            RowChange::Add { table, .. }
            | RowChange::Edit { table, .. }
            | RowChange::Remove { table, .. } => table,
        }
    }
}

/// What one applied transaction changed, as published to view syncers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaUpdate {
    /// Watermark before the transaction.
    pub previous: Option<String>,
    /// Watermark after the transaction.
    pub version: String,
    pub new_tables: Vec<TableSpec>,
    pub changes: Vec<RowChange>,
}

/// Primary key for a table seen for the first time on the stream.
fn inferred_primary_key(table: &str, row: &Row) -> Option<Vec<String>> {
    if table == CLIENTS_TABLE {
        return Some(vec!["clientGroupID".into(), "clientID".into()]);
    }
    row.contains_key("id").then(|| vec!["id".into()])
}

/// Rows written earlier in the same transaction shadow the replica.
#[derive(Default)]
struct Overlay {
    rows: BTreeMap<(String, RowKey), Option<Row>>,
    truncated: BTreeSet<String>,
}

pub struct Replicator {
    replica: Arc<dyn ReplicaStore>,
    specs: Mutex<BTreeMap<String, TableSpec>>,
    updates: broadcast::Sender<Arc<ReplicaUpdate>>,
}

impl Replicator {
    /// # Errors
    ///
    /// The replica catalog cannot be read.
    pub async fn open(replica: Arc<dyn ReplicaStore>, capacity: usize) -> anyhow::Result<Self> {
        let specs = replica
            .tables()
            .await?
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        let (updates, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            replica,
            specs: Mutex::new(specs),
            updates,
        })
    }

    /// Receiver for applied updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ReplicaUpdate>> {
        self.updates.subscribe()
    }

    #[must_use]
    pub fn replica(&self) -> &Arc<dyn ReplicaStore> {
        &self.replica
    }

    fn spec(&self, table: &str, pending: &BTreeMap<String, TableSpec>) -> Option<TableSpec> {
        pending
            .get(table)
            .cloned()
            .or_else(|| self.specs.lock().get(table).cloned())
    }

    /// Spec for `table`, inferring and recording one for unknown tables.
    fn spec_for_row(
        &self,
        table: &str,
        row: &Row,
        pending: &mut BTreeMap<String, TableSpec>,
    ) -> Result<TableSpec, ReplicationError> {
        if let Some(spec) = self.spec(table, pending) {
            return Ok(spec);
        }
        let primary_key = inferred_primary_key(table, row)
            .ok_or_else(|| ReplicationError::UnknownPrimaryKey(table.to_string()))?;
        let spec = TableSpec::infer(table, row, primary_key);
        info!(table, primary_key = ?spec.primary_key, "inferred table from replication stream");
        pending.insert(table.to_string(), spec.clone());
        Ok(spec)
    }

    async fn lookup(
        &self,
        overlay: &Overlay,
        table: &str,
        key: &RowKey,
    ) -> Result<Option<Row>, ReplicationError> {
        if let Some(row) = overlay.rows.get(&(table.to_string(), key.clone())) {
            return Ok(row.clone());
        }
        if overlay.truncated.contains(table) {
            return Ok(None);
        }
        Ok(self.replica.get(table, key).await?)
    }

    /// Applies `txn`. Returns `None` when the replica already has it.
    ///
    /// # Errors
    ///
    /// Rows of tables without a known or inferable primary key, and replica
    /// failures. Either leaves the replica at its previous watermark.
    pub async fn apply(
        &self,
        txn: &Transaction,
    ) -> Result<Option<Arc<ReplicaUpdate>>, ReplicationError> {
        let previous = self.replica.watermark().await?;
        if previous.as_deref().is_some_and(|w| txn.watermark.as_str() <= w) {
            debug!(watermark = %txn.watermark, "skipping already applied transaction");
            return Ok(None);
        }

        let mut pending_specs: BTreeMap<String, TableSpec> = BTreeMap::new();
        let mut overlay = Overlay::default();
        let mut writes = Vec::new();
        let mut changes = Vec::new();

        for change in &txn.changes {
            match change {
                DataChange::Insert { table, row } => {
                    let spec = self.spec_for_row(table, row, &mut pending_specs)?;
                    let key = row_key(row, &spec.primary_key);
                    match self.lookup(&overlay, table, &key).await? {
                        Some(old) if old == *row => continue,
                        Some(old) => changes.push(RowChange::Edit {
                            table: table.clone(),
                            old,
                            new: row.clone(),
                        }),
                        None => changes.push(RowChange::Add {
                            table: table.clone(),
                            row: row.clone(),
                        }),
                    }
                    overlay.rows.insert((table.clone(), key.clone()), Some(row.clone()));
                    writes.push(RowWrite::Upsert {
                        table: table.clone(),
                        key,
                        row: row.clone(),
                    });
                }
                DataChange::Update {
                    table,
                    old_key,
                    row,
                } => {
                    let spec = self.spec_for_row(table, row, &mut pending_specs)?;
                    let key = row_key(row, &spec.primary_key);
                    let old_key = old_key
                        .as_ref()
                        .map(|k| row_key(k, &spec.primary_key))
                        .filter(|k| *k != key);

                    if let Some(old_key) = old_key {
                        // Key change: the old row goes away, the new key is
                        // written as if inserted.
                        if let Some(old) = self.lookup(&overlay, table, &old_key).await? {
                            changes.push(RowChange::Remove {
                                table: table.clone(),
                                row: old,
                            });
                        }
                        overlay.rows.insert((table.clone(), old_key.clone()), None);
                        writes.push(RowWrite::Delete {
                            table: table.clone(),
                            key: old_key,
                        });
                    }
                    match self.lookup(&overlay, table, &key).await? {
                        Some(old) if old == *row => continue,
                        Some(old) => changes.push(RowChange::Edit {
                            table: table.clone(),
                            old,
                            new: row.clone(),
                        }),
                        None => changes.push(RowChange::Add {
                            table: table.clone(),
                            row: row.clone(),
                        }),
                    }
                    overlay.rows.insert((table.clone(), key.clone()), Some(row.clone()));
                    writes.push(RowWrite::Upsert {
                        table: table.clone(),
                        key,
                        row: row.clone(),
                    });
                }
                DataChange::Delete { table, key } => {
                    let Some(spec) = self.spec(table, &pending_specs) else {
                        debug!(table, "delete for unknown table ignored");
                        continue;
                    };
                    let key = row_key(key, &spec.primary_key);
                    let Some(old) = self.lookup(&overlay, table, &key).await? else {
                        continue;
                    };
                    changes.push(RowChange::Remove {
                        table: table.clone(),
                        row: old,
                    });
                    overlay.rows.insert((table.clone(), key.clone()), None);
                    writes.push(RowWrite::Delete {
                        table: table.clone(),
                        key,
                    });
                }
                DataChange::Truncate { tables } => {
                    for table in tables {
                        let Some(spec) = self.spec(table, &pending_specs) else {
                            continue;
                        };
                        let mut visible: BTreeMap<RowKey, Row> = BTreeMap::new();
                        if !overlay.truncated.contains(table) {
                            for row in self.replica.scan(table).await? {
                                visible.insert(row_key(&row, &spec.primary_key), row);
                            }
                        }
                        for ((t, key), row) in &overlay.rows {
                            if t != table {
                                continue;
                            }
                            match row {
                                Some(row) => visible.insert(key.clone(), row.clone()),
                                None => visible.remove(key),
                            };
                        }
                        changes.extend(visible.into_values().map(|row| RowChange::Remove {
                            table: table.clone(),
                            row,
                        }));
                        overlay.rows.retain(|(t, _), _| t != table);
                        overlay.truncated.insert(table.clone());
                        writes.push(RowWrite::Truncate {
                            table: table.clone(),
                        });
                    }
                }
            }
        }

        let new_tables: Vec<TableSpec> = pending_specs.into_values().collect();
        let batch = ReplicaBatch {
            watermark: txn.watermark.clone(),
            new_tables: new_tables.clone(),
            writes,
        };
        self.replica.apply(&batch).await?;
        {
            let mut specs = self.specs.lock();
            for spec in &new_tables {
                specs.insert(spec.name.clone(), spec.clone());
            }
        }
        metrics::counter!(TRANSACTIONS_APPLIED_TOTAL).increment(1);

        let update = Arc::new(ReplicaUpdate {
            previous,
            version: txn.watermark.clone(),
            new_tables,
            changes,
        });
        debug!(
            version = %update.version,
            changes = update.changes.len(),
            "applied transaction"
        );
        // View syncers may not be running yet; they hydrate from a snapshot.
        let _ = self.updates.send(Arc::clone(&update));
        Ok(Some(update))
    }

    /// Follows the streamer until shutdown, catching up from the replica's
    /// watermark first.
    ///
    /// # Errors
    ///
    /// Any [`ReplicationError`]. The replica stays at the last applied
    /// transaction, so a restart resumes from there.
    pub async fn run(
        &self,
        streamer: &ChangeStreamer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReplicationError> {
        loop {
            let from = self.replica.watermark().await?;
            let mut sub = streamer.subscribe(from.as_deref())?;
            info!(from = ?from, backlog = sub.catchup.len(), "replicator subscribed");
            for txn in std::mem::take(&mut sub.catchup) {
                self.apply(&txn).await?;
            }
            loop {
                tokio::select! {
                    received = sub.rx.recv() => match received {
                        Ok(txn) => {
                            self.apply(&txn).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "replicator lagged, resubscribing from the replica");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    },
                    _ = shutdown.changed() => {
                        info!("replicator stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::event::{ChangeSourceEvent, Publications};
    use crate::storage::MemoryReplica;
    use viewsync_core::data::make_row;
    use viewsync_core::Value;

    fn issue(id: i64, title: &str) -> Row {
        make_row([("id", Value::from(id)), ("title", title.into())])
    }

    fn commit(streamer: &ChangeStreamer, lsn: u64, events: Vec<ChangeSourceEvent>) -> Arc<Transaction> {
        let lsn = viewsync_core::version::format_lsn(lsn);
        streamer
            .process(ChangeSourceEvent::Begin { lsn: lsn.clone() })
            .unwrap();
        for event in events {
            streamer.process(event).unwrap();
        }
        streamer
            .process(ChangeSourceEvent::Commit { lsn })
            .unwrap()
            .unwrap()
    }

    fn insert(row: Row) -> ChangeSourceEvent {
        ChangeSourceEvent::Insert {
            table: "issue".into(),
            row,
        }
    }

    async fn setup() -> (ChangeStreamer, Replicator) {
        let replica: Arc<dyn ReplicaStore> = Arc::new(MemoryReplica::new());
        let replicator = Replicator::open(replica, 16).await.unwrap();
        (ChangeStreamer::new(Publications::default(), 16), replicator)
    }

    #[tokio::test]
    async fn resolves_changes_against_the_replica() {
        let (streamer, replicator) = setup().await;
        let txn = commit(&streamer, 1, vec![insert(issue(1, "a")), insert(issue(2, "b"))]);
        let update = replicator.apply(&txn).await.unwrap().unwrap();
        assert_eq!(update.new_tables.len(), 1);
        assert_eq!(update.changes.len(), 2);

        let txn = commit(
            &streamer,
            2,
            vec![
                ChangeSourceEvent::Update {
                    table: "issue".into(),
                    old_key: None,
                    row: issue(1, "a2"),
                },
                ChangeSourceEvent::Delete {
                    table: "issue".into(),
                    key: make_row([("id", 2)]),
                },
                // Re-inserting an identical row is not a change.
                insert(issue(1, "a2")),
            ],
        );
        let update = replicator.apply(&txn).await.unwrap().unwrap();
        assert_eq!(
            update.changes,
            vec![
                RowChange::Edit {
                    table: "issue".into(),
                    old: issue(1, "a"),
                    new: issue(1, "a2")
                },
                RowChange::Remove {
                    table: "issue".into(),
                    row: issue(2, "b")
                },
            ]
        );
        let replica = replicator.replica();
        assert_eq!(replica.scan("issue").await.unwrap(), vec![issue(1, "a2")]);
        assert_eq!(replica.watermark().await.unwrap(), Some(txn.watermark.clone()));
    }

    #[tokio::test]
    async fn redelivery_is_skipped() {
        let (streamer, replicator) = setup().await;
        let txn = commit(&streamer, 1, vec![insert(issue(1, "a"))]);
        assert!(replicator.apply(&txn).await.unwrap().is_some());
        assert!(replicator.apply(&txn).await.unwrap().is_none());
        assert_eq!(replicator.replica().scan("issue").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn key_change_and_truncate() {
        let (streamer, replicator) = setup().await;
        let txn = commit(&streamer, 1, vec![insert(issue(1, "a"))]);
        replicator.apply(&txn).await.unwrap();

        let txn = commit(
            &streamer,
            2,
            vec![
                ChangeSourceEvent::Update {
                    table: "issue".into(),
                    old_key: Some(make_row([("id", 1)])),
                    row: issue(5, "a"),
                },
                insert(issue(6, "b")),
                ChangeSourceEvent::Truncate {
                    tables: vec!["issue".into()],
                },
                insert(issue(7, "c")),
            ],
        );
        let update = replicator.apply(&txn).await.unwrap().unwrap();
        let kinds: Vec<&str> = update
            .changes
            .iter()
            .map(|c| match c {
                RowChange::Add { .. } => "add",
                RowChange::Edit { .. } => "edit",
                RowChange::Remove { .. } => "remove",
            })
            .collect();
        // remove 1, add 5, add 6, truncate removes 5 and 6, add 7.
        assert_eq!(kinds, vec!["remove", "add", "add", "remove", "remove", "add"]);
        assert_eq!(
            replicator.replica().scan("issue").await.unwrap(),
            vec![issue(7, "c")]
        );
    }

    #[tokio::test]
    async fn rows_without_a_key_are_rejected() {
        let (streamer, replicator) = setup().await;
        let txn = commit(
            &streamer,
            1,
            vec![ChangeSourceEvent::Insert {
                table: "log".into(),
                row: make_row([("line", "x")]),
            }],
        );
        assert!(matches!(
            replicator.apply(&txn).await,
            Err(ReplicationError::UnknownPrimaryKey(t)) if t == "log"
        ));
        assert_eq!(replicator.replica().watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_catches_up_and_publishes() {
        let (streamer, replicator) = setup().await;
        commit(&streamer, 1, vec![insert(issue(1, "a"))]);
        let mut updates = replicator.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);

        let replicator = Arc::new(replicator);
        let streamer = Arc::new(streamer);
        let task = {
            let replicator = Arc::clone(&replicator);
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move { replicator.run(&streamer, stop_rx).await })
        };

        let first = updates.recv().await.unwrap();
        assert_eq!(first.changes.len(), 1);
        commit(&streamer, 2, vec![insert(issue(2, "b"))]);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.previous, Some(first.version.clone()));

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
