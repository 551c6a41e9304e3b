//! Applies validated position events to the store, then the index.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ApplyEvent, ApplyOutcome, PositionEvent};
use crate::core::config::ServiceArea;
use crate::core::storage::{LocationStore, StorageError, StorageResult};
use crate::fleet::{AgentRecord, Position, SpatialIndex};

/// Shared by everything that writes store and index together. Writers take
/// it shared; an index rebuild takes it exclusively so no update can land
/// between its store scan and the rebuilt index going live.
pub type WriteGate = Arc<RwLock<()>>;

/// The only writer of both the store and the index for a given agent.
pub struct PositionApplier {
    store: Arc<dyn LocationStore>,
    index: Option<Arc<SpatialIndex>>,
    service_area: Option<ServiceArea>,
    gate: WriteGate,
}

impl PositionApplier {
    pub fn new(
        store: Arc<dyn LocationStore>,
        index: Option<Arc<SpatialIndex>>,
        service_area: Option<ServiceArea>,
    ) -> Self {
        PositionApplier {
            store,
            index,
            service_area,
            gate: WriteGate::default(),
        }
    }

    /// Shares `gate` with whoever rebuilds the index.
    pub fn with_gate(mut self, gate: WriteGate) -> Self {
        self.gate = gate;
        self
    }

    /// Previous record, or `None` when the stored value can't be decoded.
    /// The new report overwrites such a value.
    async fn previous(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        match self.store.get(agent_id).await {
            Err(StorageError::Corrupt { key, value }) => {
                warn!(
                    "[Ingest] Overwriting undecodable record {} ({:?}) for {}",
                    key, value, agent_id
                );
                Ok(None)
            }
            other => other,
        }
    }
}

#[async_trait]
impl ApplyEvent for PositionApplier {
    async fn apply(&self, event: PositionEvent, position: Position) -> StorageResult<ApplyOutcome> {
        let _shared = self.gate.read().await;
        let previous = self.previous(&event.agent_id).await?;

        if let Some(area) = &self.service_area {
            if !area.contains(position) {
                let Some(previous) = previous else {
                    return Ok(ApplyOutcome::Filtered);
                };
                self.store.delete(&event.agent_id).await?;
                if let Some(index) = &self.index {
                    index.remove(&event.agent_id, previous.position);
                }
                debug!("[Ingest] {} left the service area", event.agent_id);
                return Ok(ApplyOutcome::Departed);
            }
        }

        let record = AgentRecord::new(event.agent_id, position, event.engaged);
        self.store.put(record.clone()).await?;
        if let Some(index) = &self.index {
            let agent_id = record.agent_id.clone();
            index.upsert(&agent_id, previous.map(|r| r.position), record);
        }
        Ok(ApplyOutcome::Applied)
    }
}
