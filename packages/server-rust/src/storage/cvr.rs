//! In-memory CVR store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use viewsync_core::CvrVersion;

use super::{check_expected, CvrStore};
use crate::cvr::CvrRecord;

/// Records keyed by client group id.
#[derive(Default, Clone)]
pub struct MemoryCvrStore {
    records: Arc<DashMap<String, CvrRecord>>,
}

impl MemoryCvrStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CvrStore for MemoryCvrStore {
    async fn load(&self, client_group_id: &str) -> anyhow::Result<Option<CvrRecord>> {
        Ok(self.records.get(client_group_id).map(|r| r.value().clone()))
    }

    async fn flush(
        &self,
        record: &CvrRecord,
        expected: Option<&CvrVersion>,
    ) -> anyhow::Result<()> {
        let entry = self.records.entry(record.id.clone());
        let stored = match &entry {
            Entry::Occupied(e) => Some(e.get().version.clone()),
            Entry::Vacant(_) => None,
        };
        check_expected(&record.id, stored.as_ref(), expected)?;
        entry.insert(record.clone());
        Ok(())
    }

    async fn delete(&self, client_group_id: &str) -> anyhow::Result<()> {
        self.records.remove(client_group_id);
        Ok(())
    }

    async fn gc(&self, now_ms: u64, ttl_ms: u64) -> anyhow::Result<Vec<String>> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| now_ms.saturating_sub(r.last_active) > ttl_ms)
            .map(|r| r.key().clone())
            .collect();
        for id in &expired {
            self.records.remove(id);
        }
        Ok(expired)
    }

    async fn ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.records.iter().map(|r| r.key().clone()).collect())
    }
}
