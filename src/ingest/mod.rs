//! Ingestion Pipeline
//!
//! Decouples receipt of position events from their application to the store
//! and index. Producers enqueue onto bounded lanes; a fixed pool of tokio
//! workers drains them. Every event for a given agent goes through the same
//! lane, so per-agent order is the enqueue order whatever the pool size.

pub mod applier;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::IngestConfig;
use crate::core::error::{DispatchError, ValidationError};
use crate::core::storage::StorageResult;
use crate::fleet::Position;

pub use applier::{PositionApplier, WriteGate};

/// A decoded position report, as handed over by a transport adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub agent_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub engaged: bool,
}

impl PositionEvent {
    pub fn new(agent_id: impl Into<String>, position: Position, engaged: bool) -> Self {
        PositionEvent {
            agent_id: agent_id.into(),
            latitude: position.latitude,
            longitude: position.longitude,
            engaged,
        }
    }

    pub fn validate(&self) -> Result<Position, ValidationError> {
        if self.agent_id.trim().is_empty() {
            return Err(ValidationError::EmptyAgentId);
        }
        Position::validated(self.latitude, self.longitude)
    }
}

/// What a worker did with one valid event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Outside this node's service area, agent unknown here.
    Filtered,
    /// Outside this node's service area; the agent's old record was dropped.
    Departed,
}

/// Consumer side of the pipeline.
#[async_trait]
pub trait ApplyEvent: Send + Sync + 'static {
    async fn apply(&self, event: PositionEvent, position: Position) -> StorageResult<ApplyOutcome>;
}

/// Point-in-time pipeline counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub accepted: u64,
    pub applied: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct PipelineCounters {
    accepted: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded producer/consumer pipeline with an explicit shutdown.
pub struct IngestionPipeline {
    lanes: RwLock<Vec<mpsc::Sender<PositionEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PipelineCounters>,
    lane_capacity: usize,
    enqueue_timeout: Duration,
}

impl IngestionPipeline {
    /// Spawns `config.workers` lanes onto the current tokio runtime.
    pub fn spawn(config: &IngestConfig, sink: Arc<dyn ApplyEvent>) -> Self {
        let workers = config.workers.max(1);
        let lane_capacity = config.queue_capacity.max(1);
        let counters = Arc::new(PipelineCounters::default());

        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(lane_capacity);
            lanes.push(tx);
            handles.push(tokio::spawn(run_lane(
                lane,
                rx,
                sink.clone(),
                counters.clone(),
            )));
        }

        info!(
            "📥 [Ingest] Started {} workers (lane capacity {})",
            workers, lane_capacity
        );

        IngestionPipeline {
            lanes: RwLock::new(lanes),
            workers: Mutex::new(handles),
            counters,
            lane_capacity,
            enqueue_timeout: config.enqueue_timeout(),
        }
    }

    fn lane_for(&self, agent_id: &str, lanes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        (hasher.finish() % lanes as u64) as usize
    }

    fn sender_for(&self, agent_id: &str) -> Result<mpsc::Sender<PositionEvent>, DispatchError> {
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return Err(DispatchError::PipelineClosed);
        }
        Ok(lanes[self.lane_for(agent_id, lanes.len())].clone())
    }

    /// Enqueues an event, waiting at most the configured enqueue timeout for room.
    pub async fn submit(&self, event: PositionEvent) -> Result<(), DispatchError> {
        let sender = self.sender_for(&event.agent_id)?;
        match sender.send_timeout(event, self.enqueue_timeout).await {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(event)) => {
                warn!("[Ingest] Lane full, dropping update for {}", event.agent_id);
                Err(DispatchError::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(DispatchError::PipelineClosed),
        }
    }

    /// Enqueues without waiting.
    pub fn try_submit(&self, event: PositionEvent) -> Result<(), DispatchError> {
        let sender = self.sender_for(&event.agent_id)?;
        match sender.try_send(event) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(DispatchError::PipelineClosed),
        }
    }

    /// Counts an event rejected before it reached a lane.
    pub(crate) fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Events waiting across all lanes.
    pub fn queue_depth(&self) -> usize {
        self.lanes
            .read()
            .iter()
            .map(|lane| self.lane_capacity - lane.capacity())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.read().is_empty()
    }

    /// Closes every lane and waits until the workers have applied all queued
    /// events. Later submissions fail with `PipelineClosed`.
    pub async fn shutdown(&self) {
        let lanes = std::mem::take(&mut *self.lanes.write());
        drop(lanes);
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if let Err(e) = handle.await {
                error!("[Ingest] Worker ended abnormally: {}", e);
            }
        }
        let stats = self.stats();
        info!(
            "📥 [Ingest] Drained: {} applied, {} rejected, {} filtered, {} failed",
            stats.applied, stats.rejected, stats.filtered, stats.failed
        );
    }
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::Receiver<PositionEvent>,
    sink: Arc<dyn ApplyEvent>,
    counters: Arc<PipelineCounters>,
) {
    while let Some(event) = rx.recv().await {
        let position = match event.validate() {
            Ok(p) => p,
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("[Ingest] Dropping malformed event {:?}: {}", event.agent_id, e);
                continue;
            }
        };

        let agent_id = event.agent_id.clone();
        let sink = sink.clone();
        // Run each event in its own task so a panic stays with that event.
        let result = tokio::spawn(async move { sink.apply(event, position).await }).await;

        match result {
            Ok(Ok(ApplyOutcome::Applied)) => {
                counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(ApplyOutcome::Filtered)) | Ok(Ok(ApplyOutcome::Departed)) => {
                counters.filtered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("[Ingest] Failed to apply update for {}: {}", agent_id, e);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("[Ingest] Update for {} panicked: {}", agent_id, e);
            }
        }
    }
    debug!("[Ingest] Lane {} drained", lane);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::StorageError;
    use std::collections::HashMap;

    /// Records applied events per agent, in order.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<HashMap<String, Vec<Position>>>,
    }

    #[async_trait]
    impl ApplyEvent for Recorder {
        async fn apply(
            &self,
            event: PositionEvent,
            position: Position,
        ) -> StorageResult<ApplyOutcome> {
            if event.agent_id == "boom" {
                panic!("poisoned event");
            }
            if event.agent_id == "flaky" {
                return Err(StorageError::Unavailable("down".into()));
            }
            tokio::task::yield_now().await;
            self.seen
                .lock()
                .entry(event.agent_id)
                .or_default()
                .push(position);
            Ok(ApplyOutcome::Applied)
        }
    }

    fn config(workers: usize, capacity: usize) -> IngestConfig {
        IngestConfig {
            workers,
            queue_capacity: capacity,
            enqueue_timeout_ms: 100,
        }
    }

    fn event(id: &str, lat: f64) -> PositionEvent {
        PositionEvent::new(id, Position::new(lat, 0.0), false)
    }

    #[test]
    fn validate_rejects_malformed_events() {
        assert_eq!(
            event(" ", 1.0).validate(),
            Err(ValidationError::EmptyAgentId)
        );
        assert_eq!(
            event("a", 100.0).validate(),
            Err(ValidationError::LatitudeOutOfRange(100.0))
        );
        assert!(event("a", 45.0).validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_agent_order_survives_any_pool_size() {
        for workers in [1, 3, 8] {
            let recorder = Arc::new(Recorder::default());
            let pipeline = IngestionPipeline::spawn(&config(workers, 16), recorder.clone());

            for step in 0..200 {
                for agent in ["a", "b", "c", "d", "e"] {
                    pipeline.submit(event(agent, step as f64 * 0.1)).await.unwrap();
                }
            }
            pipeline.shutdown().await;

            let seen = recorder.seen.lock();
            for agent in ["a", "b", "c", "d", "e"] {
                let lats: Vec<f64> = seen[agent].iter().map(|p| p.latitude).collect();
                assert_eq!(lats.len(), 200);
                assert!(lats.windows(2).all(|w| w[0] < w[1]), "out of order for {}", agent);
            }
            assert_eq!(pipeline.stats().applied, 1000);
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = IngestionPipeline::spawn(&config(2, 512), recorder.clone());
        for i in 0..300 {
            pipeline.try_submit(event(&format!("cab-{}", i), 1.0)).unwrap();
        }
        pipeline.shutdown().await;

        assert_eq!(recorder.seen.lock().len(), 300);
        assert_eq!(pipeline.queue_depth(), 0);
        assert!(pipeline.is_closed());
        assert!(matches!(
            pipeline.submit(event("late", 1.0)).await,
            Err(DispatchError::PipelineClosed)
        ));
    }

    #[tokio::test]
    async fn faults_are_isolated_per_event() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = IngestionPipeline::spawn(&config(1, 64), recorder.clone());

        pipeline.submit(event("ok-1", 1.0)).await.unwrap();
        pipeline.submit(event("boom", 1.0)).await.unwrap();
        pipeline.submit(event("flaky", 1.0)).await.unwrap();
        pipeline.submit(event("", 1.0)).await.unwrap();
        pipeline.submit(event("ok-2", 95.0)).await.unwrap();
        pipeline.submit(event("ok-3", 2.0)).await.unwrap();
        pipeline.shutdown().await;

        let stats = pipeline.stats();
        assert_eq!(stats.accepted, 6);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.rejected, 2);
        let seen = recorder.seen.lock();
        assert!(seen.contains_key("ok-1") && seen.contains_key("ok-3"));
    }

    #[tokio::test]
    async fn full_lane_times_out_instead_of_blocking() {
        struct Stall;

        #[async_trait]
        impl ApplyEvent for Stall {
            async fn apply(&self, _: PositionEvent, _: Position) -> StorageResult<ApplyOutcome> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ApplyOutcome::Applied)
            }
        }

        let pipeline = IngestionPipeline::spawn(&config(1, 1), Arc::new(Stall));
        // First event is taken by the worker, second fills the lane.
        pipeline.submit(event("a", 1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.submit(event("a", 2.0)).await.unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(
            pipeline.submit(event("a", 3.0)).await,
            Err(DispatchError::QueueFull)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            pipeline.try_submit(event("a", 4.0)),
            Err(DispatchError::QueueFull)
        ));
        assert_eq!(pipeline.queue_depth(), 1);
    }
}
