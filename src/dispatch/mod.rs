//! Dispatch Service
//!
//! One query/update facade for every node that owns a replica of the fleet.
//! A "central" node and a "local cluster" node differ only in configuration:
//! the store they bind to, whether they keep a warm grid index, and an
//! optional service area.

pub mod sweeper;
pub mod wire;

#[cfg(test)]
mod dispatch_test;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::{FleetConfig, GridConfig};
use crate::core::error::{DispatchError, DispatchResult};
use crate::core::storage::{self, LocationStore};
use crate::fleet::{geo, AgentRecord, NearestMatch, Position, SpatialIndex};
use crate::ingest::{IngestionPipeline, PipelineStats, PositionApplier, PositionEvent, WriteGate};

pub use sweeper::StaleSweeper;
pub use wire::{DispatchFailure, DispatchQuery, DispatchResponse, PositionReport, UpdateAck};

/// Service-level counters.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchStats {
    pub node: String,
    pub warm_index: bool,
    pub indexed_agents: usize,
    pub queue_depth: usize,
    pub pipeline: PipelineStats,
}

pub struct DispatchService {
    node: String,
    store: Arc<dyn LocationStore>,
    index: Option<Arc<SpatialIndex>>,
    warm: AtomicBool,
    gate: WriteGate,
    pipeline: IngestionPipeline,
    grid: GridConfig,
    stale_after: Duration,
}

impl DispatchService {
    /// Builds the store named by `config.store` and starts the node.
    pub async fn from_config(config: &FleetConfig) -> DispatchResult<Self> {
        Self::start(config, storage::connect(&config.store)).await
    }

    /// Starts the ingestion workers over `store` and, when the node keeps an
    /// index, warms it from the store's current contents.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: &FleetConfig, store: Arc<dyn LocationStore>) -> DispatchResult<Self> {
        let index = config
            .node
            .index_enabled
            .then(|| Arc::new(SpatialIndex::from_config(&config.grid)));

        let gate = WriteGate::default();
        let applier = PositionApplier::new(store.clone(), index.clone(), config.service_area)
            .with_gate(gate.clone());
        let pipeline = IngestionPipeline::spawn(&config.ingest, Arc::new(applier));

        let service = DispatchService {
            node: config.node.name.clone(),
            store,
            index,
            warm: AtomicBool::new(false),
            gate,
            pipeline,
            grid: config.grid.clone(),
            stale_after: config.store.stale_after(),
        };

        if service.index.is_some() {
            if let Err(e) = service.warm_up().await {
                warn!(
                    "[Dispatch] {} starting cold, queries will scan the store: {}",
                    service.node, e
                );
            }
        }
        info!(
            "🚕 [Dispatch] Node '{}' ready ({} store, index {})",
            service.node,
            service.store.backend(),
            if service.has_warm_index() { "warm" } else { "off" }
        );
        Ok(service)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn index(&self) -> Option<&Arc<SpatialIndex>> {
        self.index.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn LocationStore> {
        &self.store
    }

    pub fn has_warm_index(&self) -> bool {
        self.index.is_some() && self.warm.load(Ordering::Acquire)
    }

    /// Rebuilds the index from a full store scan. Queries use the scan path
    /// until this completes; updates wait in their lanes.
    pub async fn warm_up(&self) -> DispatchResult<usize> {
        let Some(index) = self.index.clone() else {
            return Ok(0);
        };
        let _exclusive = self.gate.write().await;
        self.warm.store(false, Ordering::Release);

        let records = self.store.scan_all().await?;
        let count = records.len();
        tokio::task::spawn_blocking(move || index.rebuild(records))
            .await
            .map_err(|e| DispatchError::Store(storage::StorageError::OperationFailed(e.to_string())))?;

        self.warm.store(true, Ordering::Release);
        info!("[Dispatch] Index warmed with {} agents", count);
        Ok(count)
    }

    // ── Updates ─────────────────────────────────────────────────────────────

    /// Queues a position update. The write becomes visible once a worker
    /// applies it.
    pub async fn report_position(
        &self,
        agent_id: &str,
        position: Position,
        engaged: bool,
    ) -> DispatchResult<UpdateAck> {
        let event = PositionEvent::new(agent_id, position, engaged);
        if let Err(e) = event.validate() {
            self.pipeline.record_rejected();
            return Err(e.into());
        }
        self.pipeline.submit(event).await?;
        Ok(UpdateAck::accepted())
    }

    pub async fn handle_report(&self, report: PositionReport) -> DispatchResult<UpdateAck> {
        let position = Position::new(report.latitude, report.longitude);
        self.report_position(&report.agent_id, position, report.engaged)
            .await
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Nearest agent with `engaged == false`, answered from the index when it
    /// is warm and from a store scan otherwise.
    pub async fn find_nearest_available(
        &self,
        origin: Position,
        deadline: Instant,
    ) -> DispatchResult<String> {
        let origin = Position::validated(origin.latitude, origin.longitude)?;

        let found = match &self.index {
            Some(index) if self.has_warm_index() => {
                index.find_nearest(origin, AgentRecord::is_available, Some(deadline))?
            }
            _ => self.scan_nearest(origin, deadline).await?,
        };

        match found {
            Some(m) => {
                debug!(
                    "[Dispatch] {} -> {} ({:.3} km)",
                    self.node, m.agent_id, m.distance_km
                );
                Ok(m.agent_id)
            }
            None => Err(DispatchError::NotFound),
        }
    }

    pub async fn handle_query(&self, query: DispatchQuery) -> DispatchResponse {
        let result = match (query.origin(), query.budget()) {
            (Ok(origin), Ok(budget)) => {
                self.find_nearest_available(origin, Instant::now() + budget)
                    .await
            }
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        };
        DispatchResponse::from(result)
    }

    /// Degraded path: linear minimization over a store snapshot, with the
    /// same search window and ordering as the index search.
    async fn scan_nearest(
        &self,
        origin: Position,
        deadline: Instant,
    ) -> DispatchResult<Option<NearestMatch>> {
        let scan = tokio::time::timeout_at(deadline.into(), self.store.scan_all());
        let records = scan.await.map_err(|_| DispatchError::Timeout)??;
        if Instant::now() >= deadline {
            return Err(DispatchError::Timeout);
        }

        let grid = &self.grid;
        Ok(records
            .par_iter()
            .filter(|r| r.is_available() && grid.within_search_radius(origin, r.position))
            .map(|r| NearestMatch {
                agent_id: r.agent_id.clone(),
                distance_km: geo::distance(origin, r.position),
            })
            .reduce_with(NearestMatch::closer_of))
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Deletes agents not heard from within the staleness window, from both
    /// store and index. Returns how many were evicted from the store.
    ///
    /// The store delete is conditional on the record still being stale, so
    /// a report that lands mid-sweep survives.
    pub async fn evict_stale(&self) -> DispatchResult<usize> {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let _shared = self.gate.read().await;

        let records = self.store.scan_all().await?;
        let mut evicted = HashSet::new();
        for record in &records {
            if record.updated_at >= cutoff {
                continue;
            }
            if self
                .store
                .remove_if_older(&record.agent_id, cutoff)
                .await?
                .is_some()
            {
                evicted.insert(record.agent_id.as_str());
            }
        }
        // Agents the store dropped itself (expired keys) are absent from the scan.
        let scanned: HashSet<&str> = records.iter().map(|r| r.agent_id.as_str()).collect();
        let dropped = self.index.as_ref().map_or(0, |index| {
            index.remove_older_than(cutoff, |id| evicted.contains(id) || !scanned.contains(id))
        });
        let evicted = evicted.len();
        if evicted > 0 || dropped > 0 {
            info!(
                "[Dispatch] Evicted {} stale agents ({} from the index)",
                evicted, dropped
            );
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            node: self.node.clone(),
            warm_index: self.has_warm_index(),
            indexed_agents: self.index.as_ref().map_or(0, |i| i.len()),
            queue_depth: self.pipeline.queue_depth(),
            pipeline: self.pipeline.stats(),
        }
    }

    /// Stops accepting updates and applies everything already queued.
    pub async fn shutdown(&self) {
        info!("[Dispatch] Node '{}' shutting down", self.node);
        self.pipeline.shutdown().await;
    }
}
