//! In-memory replica.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use viewsync_core::data::{Row, RowKey};
use viewsync_core::TableSpec;

use super::{ReplicaBatch, ReplicaSnapshot, ReplicaStore, RowWrite};

#[derive(Default)]
struct Inner {
    watermark: Option<String>,
    specs: BTreeMap<String, TableSpec>,
    rows: BTreeMap<String, BTreeMap<RowKey, Row>>,
}

/// Replica held in process memory. Lost on restart, so the upstream must
/// be replayed from the beginning.
#[derive(Default)]
pub struct MemoryReplica {
    inner: RwLock<Inner>,
}

impl MemoryReplica {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplica {
    async fn watermark(&self) -> anyhow::Result<Option<String>> {
        Ok(self.inner.read().watermark.clone())
    }

    async fn tables(&self) -> anyhow::Result<Vec<TableSpec>> {
        Ok(self.inner.read().specs.values().cloned().collect())
    }

    async fn declare_table(&self, spec: &TableSpec) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        inner.specs.insert(spec.name.clone(), spec.clone());
        inner.rows.entry(spec.name.clone()).or_default();
        Ok(())
    }

    async fn get(&self, table: &str, key: &RowKey) -> anyhow::Result<Option<Row>> {
        Ok(self
            .inner
            .read()
            .rows
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn scan(&self, table: &str) -> anyhow::Result<Vec<Row>> {
        Ok(self
            .inner
            .read()
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, batch: &ReplicaBatch) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        for spec in &batch.new_tables {
            inner.specs.insert(spec.name.clone(), spec.clone());
            inner.rows.entry(spec.name.clone()).or_default();
        }
        for write in &batch.writes {
            match write {
                RowWrite::Upsert { table, key, row } => {
                    inner
                        .rows
                        .entry(table.clone())
                        .or_default()
                        .insert(key.clone(), row.clone());
                }
                RowWrite::Delete { table, key } => {
                    if let Some(rows) = inner.rows.get_mut(table) {
                        rows.remove(key);
                    }
                }
                RowWrite::Truncate { table } => {
                    if let Some(rows) = inner.rows.get_mut(table) {
                        rows.clear();
                    }
                }
            }
        }
        inner.watermark = Some(batch.watermark.clone());
        Ok(())
    }

    async fn snapshot(&self) -> anyhow::Result<ReplicaSnapshot> {
        let inner = self.inner.read();
        let tables = inner
            .specs
            .values()
            .map(|spec| {
                let rows = inner
                    .rows
                    .get(&spec.name)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default();
                (spec.clone(), rows)
            })
            .collect();
        Ok(ReplicaSnapshot {
            watermark: inner.watermark.clone(),
            tables,
        })
    }
}
