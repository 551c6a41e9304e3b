//! In-process location store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{LocationStore, StorageResult};
use crate::fleet::AgentRecord;

/// `DashMap`-backed store. Writers for different agents land on different
/// shards and don't block each other.
#[derive(Default)]
pub struct MemoryLocationStore {
    records: DashMap<String, AgentRecord>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        Ok(self.records.get(agent_id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: AgentRecord) -> StorageResult<()> {
        self.records.insert(record.agent_id.clone(), record);
        Ok(())
    }

    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete(&self, agent_id: &str) -> StorageResult<()> {
        self.records.remove(agent_id);
        Ok(())
    }

    async fn remove_if_older(
        &self,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>> {
        Ok(self
            .records
            .remove_if(agent_id, |_, record| record.updated_at < cutoff)
            .map(|(_, record)| record))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
