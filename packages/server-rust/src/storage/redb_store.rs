//! `redb`-backed replica and CVR store.
//!
//! One database file holds four tables. Replica rows are keyed by
//! `table \0 json(key)` so that one table's rows form a contiguous range.
//! Values are named `MsgPack`. Calls block the calling thread for the
//! duration of one `redb` transaction.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tracing::info;
use viewsync_core::data::{Row, RowKey};
use viewsync_core::{CvrVersion, TableSpec};

use super::{
    check_expected, replica_row_key, CvrStore, ReplicaBatch, ReplicaSnapshot, ReplicaStore,
    RowWrite,
};
use crate::cvr::CvrRecord;

const ROWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("replica-rows-1");
const CATALOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("replica-catalog-1");
const STATE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("replication-state-1");
const CVR_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("client-views-1");

const WATERMARK_KEY: &str = "watermark";

/// Bounds of the key range holding `table`'s rows.
fn table_range(table: &str) -> (String, String) {
    (format!("{table}\u{0}"), format!("{table}\u{1}"))
}

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// The parent directory cannot be created or the file cannot be opened.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening replica database");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory at {}", parent.display())
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open replica database")?;
        Self::open(db)
    }

    /// # Errors
    ///
    /// The in-memory backend refuses to initialize.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self> {
        let tx = db.begin_write()?;
        {
            let _rows = tx.open_table(ROWS_TABLE)?;
            let _catalog = tx.open_table(CATALOG_TABLE)?;
            let _state = tx.open_table(STATE_TABLE)?;
            let _cvrs = tx.open_table(CVR_TABLE)?;
        }
        tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }
}

fn decode_rows(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> Result<Vec<Row>> {
    let (start, end) = table_range(name);
    let mut rows = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, value) = entry?;
        rows.push(rmp_serde::from_slice(value.value())?);
    }
    Ok(rows)
}

fn decode_specs(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<TableSpec>> {
    let mut specs = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        specs.push(rmp_serde::from_slice(value.value())?);
    }
    Ok(specs)
}

#[async_trait]
impl ReplicaStore for RedbStore {
    async fn watermark(&self) -> Result<Option<String>> {
        let tx = self.db.begin_read()?;
        let state = tx.open_table(STATE_TABLE)?;
        Ok(state.get(WATERMARK_KEY)?.map(|v| v.value().to_string()))
    }

    async fn tables(&self) -> Result<Vec<TableSpec>> {
        let tx = self.db.begin_read()?;
        let catalog = tx.open_table(CATALOG_TABLE)?;
        decode_specs(&catalog)
    }

    async fn declare_table(&self, spec: &TableSpec) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(spec)?;
        let tx = self.db.begin_write()?;
        {
            let mut catalog = tx.open_table(CATALOG_TABLE)?;
            catalog.insert(spec.name.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, table: &str, key: &RowKey) -> Result<Option<Row>> {
        let tx = self.db.begin_read()?;
        let rows = tx.open_table(ROWS_TABLE)?;
        let key = replica_row_key(table, key);
        let Some(value) = rows.get(key.as_str())? else {
            return Ok(None);
        };
        Ok(Some(rmp_serde::from_slice(value.value())?))
    }

    async fn scan(&self, table: &str) -> Result<Vec<Row>> {
        let tx = self.db.begin_read()?;
        let rows = tx.open_table(ROWS_TABLE)?;
        decode_rows(&rows, table)
    }

    async fn apply(&self, batch: &ReplicaBatch) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut catalog = tx.open_table(CATALOG_TABLE)?;
            for spec in &batch.new_tables {
                let bytes = rmp_serde::to_vec_named(spec)?;
                catalog.insert(spec.name.as_str(), bytes.as_slice())?;
            }

            let mut rows = tx.open_table(ROWS_TABLE)?;
            for write in &batch.writes {
                match write {
                    RowWrite::Upsert { table, key, row } => {
                        let bytes = rmp_serde::to_vec_named(row)?;
                        rows.insert(replica_row_key(table, key).as_str(), bytes.as_slice())?;
                    }
                    RowWrite::Delete { table, key } => {
                        rows.remove(replica_row_key(table, key).as_str())?;
                    }
                    RowWrite::Truncate { table } => {
                        let (start, end) = table_range(table);
                        let mut keys = Vec::new();
                        for entry in rows.range(start.as_str()..end.as_str())? {
                            let (key, _) = entry?;
                            keys.push(key.value().to_string());
                        }
                        for key in keys {
                            rows.remove(key.as_str())?;
                        }
                    }
                }
            }

            let mut state = tx.open_table(STATE_TABLE)?;
            state.insert(WATERMARK_KEY, batch.watermark.as_str())?;
        }
        tx.commit().context("failed to commit replica batch")?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<ReplicaSnapshot> {
        let tx = self.db.begin_read()?;
        let state = tx.open_table(STATE_TABLE)?;
        let catalog = tx.open_table(CATALOG_TABLE)?;
        let rows = tx.open_table(ROWS_TABLE)?;

        let watermark = state.get(WATERMARK_KEY)?.map(|v| v.value().to_string());
        let mut tables = Vec::new();
        for spec in decode_specs(&catalog)? {
            let table_rows = decode_rows(&rows, &spec.name)?;
            tables.push((spec, table_rows));
        }
        Ok(ReplicaSnapshot { watermark, tables })
    }
}

#[async_trait]
impl CvrStore for RedbStore {
    async fn load(&self, client_group_id: &str) -> Result<Option<CvrRecord>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CVR_TABLE)?;
        let Some(value) = table.get(client_group_id)? else {
            return Ok(None);
        };
        let record = rmp_serde::from_slice(value.value())
            .with_context(|| format!("corrupt client view record {client_group_id}"))?;
        Ok(Some(record))
    }

    async fn flush(&self, record: &CvrRecord, expected: Option<&CvrVersion>) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(record)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CVR_TABLE)?;
            let stored: Option<CvrRecord> = match table.get(record.id.as_str())? {
                Some(value) => Some(rmp_serde::from_slice(value.value())?),
                None => None,
            };
            check_expected(&record.id, stored.as_ref().map(|r| &r.version), expected)?;
            table.insert(record.id.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, client_group_id: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CVR_TABLE)?;
            table.remove(client_group_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn gc(&self, now_ms: u64, ttl_ms: u64) -> Result<Vec<String>> {
        let tx = self.db.begin_write()?;
        let mut expired = Vec::new();
        {
            let mut table = tx.open_table(CVR_TABLE)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let record: CvrRecord = rmp_serde::from_slice(value.value())?;
                if now_ms.saturating_sub(record.last_active) > ttl_ms {
                    expired.push(key.value().to_string());
                }
            }
            for id in &expired {
                table.remove(id.as_str())?;
            }
        }
        tx.commit()?;
        Ok(expired)
    }

    async fn ids(&self) -> Result<Vec<String>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CVR_TABLE)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::is_conflict;
    use viewsync_core::data::make_row;
    use viewsync_core::{ColumnType, Value};

    fn spec(name: &str) -> TableSpec {
        TableSpec::new(name, [("id", ColumnType::Number)], &["id"])
    }

    fn upsert(table: &str, id: i64) -> RowWrite {
        RowWrite::Upsert {
            table: table.into(),
            key: vec![Value::from(id)],
            row: make_row([("id", id)]),
        }
    }

    #[tokio::test]
    async fn replica_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.redb");
        {
            let store = RedbStore::persistent(&path).unwrap();
            store
                .apply(&ReplicaBatch {
                    watermark: "0a".into(),
                    new_tables: vec![spec("issue"), spec("issues")],
                    writes: vec![upsert("issue", 1), upsert("issue", 2), upsert("issues", 3)],
                })
                .await
                .unwrap();
        }
        let store = RedbStore::persistent(&path).unwrap();
        assert_eq!(store.watermark().await.unwrap().as_deref(), Some("0a"));
        // Prefix ranges do not bleed into tables sharing a name prefix.
        assert_eq!(store.scan("issue").await.unwrap().len(), 2);
        assert_eq!(store.scan("issues").await.unwrap().len(), 1);
        assert!(store
            .get("issue", &vec![Value::from(2)])
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_and_truncate() {
        let store = RedbStore::in_memory().unwrap();
        store
            .apply(&ReplicaBatch {
                watermark: "01".into(),
                new_tables: vec![spec("a"), spec("b")],
                writes: vec![upsert("a", 1), upsert("a", 2), upsert("b", 1)],
            })
            .await
            .unwrap();
        store
            .apply(&ReplicaBatch {
                watermark: "02".into(),
                new_tables: Vec::new(),
                writes: vec![
                    RowWrite::Delete {
                        table: "a".into(),
                        key: vec![Value::from(1)],
                    },
                    RowWrite::Truncate { table: "b".into() },
                ],
            })
            .await
            .unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.watermark.as_deref(), Some("02"));
        let counts: Vec<(String, usize)> = snapshot
            .tables
            .iter()
            .map(|(spec, rows)| (spec.name.clone(), rows.len()))
            .collect();
        assert_eq!(counts, vec![("a".to_string(), 1), ("b".to_string(), 0)]);
    }

    #[tokio::test]
    async fn cvr_flush_conflicts_and_gc() {
        let store = RedbStore::in_memory().unwrap();
        let mut record = CvrRecord::new("g1", 0);
        store.flush(&record, None).await.unwrap();
        assert!(is_conflict(&store.flush(&record, None).await.unwrap_err()));

        let previous = record.version.clone();
        record.version = previous.bump_minor();
        record.last_active = 50;
        store.flush(&record, Some(&previous)).await.unwrap();
        assert_eq!(store.load("g1").await.unwrap(), Some(record));

        assert!(store.gc(100, 60).await.unwrap().is_empty());
        assert_eq!(store.gc(200, 60).await.unwrap(), vec!["g1".to_string()]);
        assert!(store.ids().await.unwrap().is_empty());
    }
}
