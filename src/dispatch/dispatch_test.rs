use super::*;
use crate::core::config::{IngestConfig, ServiceArea};
use crate::core::storage::{MemoryLocationStore, StorageError, StorageResult};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

fn config(index_enabled: bool, workers: usize) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.node.index_enabled = index_enabled;
    config.ingest = IngestConfig {
        workers,
        queue_capacity: 256,
        enqueue_timeout_ms: 500,
    };
    config
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

async fn node(index_enabled: bool) -> (Arc<MemoryLocationStore>, DispatchService) {
    let store = Arc::new(MemoryLocationStore::new());
    let service = DispatchService::start(&config(index_enabled, 4), store.clone())
        .await
        .unwrap();
    (store, service)
}

async fn report(service: &DispatchService, id: &str, lat: f64, lon: f64, engaged: bool) {
    service
        .report_position(id, Position::new(lat, lon), engaged)
        .await
        .unwrap();
}

/// Store whose calls all fail as if the backend were down.
struct DownStore;

#[async_trait]
impl LocationStore for DownStore {
    async fn get(&self, _: &str) -> StorageResult<Option<AgentRecord>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn put(&self, _: AgentRecord) -> StorageResult<()> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _: &str) -> StorageResult<()> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn remove_if_older(
        &self,
        _: &str,
        _: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    fn backend(&self) -> &'static str {
        "down"
    }
}

/// Store whose scans take far longer than any query budget.
struct SlowStore;

#[async_trait]
impl LocationStore for SlowStore {
    async fn get(&self, _: &str) -> StorageResult<Option<AgentRecord>> {
        Ok(None)
    }
    async fn put(&self, _: AgentRecord) -> StorageResult<()> {
        Ok(())
    }
    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
    async fn delete(&self, _: &str) -> StorageResult<()> {
        Ok(())
    }
    async fn remove_if_older(
        &self,
        _: &str,
        _: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>> {
        Ok(None)
    }
    fn backend(&self) -> &'static str {
        "slow"
    }
}

/// Memory store with hooks into `scan_all`: it can pause after taking its
/// snapshot, or write a newer record right after it.
struct HookedStore {
    inner: Arc<MemoryLocationStore>,
    pause_next_scan: AtomicBool,
    scanned: Notify,
    resume: Notify,
    write_after_scan: parking_lot::Mutex<Option<AgentRecord>>,
}

impl HookedStore {
    fn new(inner: Arc<MemoryLocationStore>) -> Self {
        HookedStore {
            inner,
            pause_next_scan: AtomicBool::new(false),
            scanned: Notify::new(),
            resume: Notify::new(),
            write_after_scan: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationStore for HookedStore {
    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        self.inner.get(agent_id).await
    }
    async fn put(&self, record: AgentRecord) -> StorageResult<()> {
        self.inner.put(record).await
    }
    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>> {
        let snapshot = self.inner.scan_all().await?;
        if self.pause_next_scan.swap(false, Ordering::SeqCst) {
            self.scanned.notify_one();
            self.resume.notified().await;
        }
        let late = self.write_after_scan.lock().take();
        if let Some(record) = late {
            self.inner.put(record).await?;
        }
        Ok(snapshot)
    }
    async fn delete(&self, agent_id: &str) -> StorageResult<()> {
        self.inner.delete(agent_id).await
    }
    async fn remove_if_older(
        &self,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>> {
        self.inner.remove_if_older(agent_id, cutoff).await
    }
    fn backend(&self) -> &'static str {
        "hooked"
    }
}

#[tokio::test]
async fn engaged_agent_is_skipped_even_when_closer() {
    for index_enabled in [true, false] {
        let (_, service) = node(index_enabled).await;
        report(&service, "first", 40.0, -74.0, false).await;
        report(&service, "second", 40.1, -73.9, false).await;
        report(&service, "third", 40.05, -73.95, true).await;
        service.shutdown().await;

        let found = service
            .find_nearest_available(Position::new(40.0, -74.0), soon())
            .await
            .unwrap();
        assert_eq!(found, "first");

        let found = service
            .find_nearest_available(Position::new(40.06, -73.94), soon())
            .await
            .unwrap();
        assert_eq!(found, "second", "index_enabled = {}", index_enabled);
    }
}

#[tokio::test]
async fn empty_or_fully_engaged_fleet_is_not_found() {
    let (_, service) = node(true).await;
    assert!(matches!(
        service
            .find_nearest_available(Position::new(10.0, 10.0), soon())
            .await,
        Err(DispatchError::NotFound)
    ));

    report(&service, "busy-1", 10.0, 10.0, true).await;
    report(&service, "busy-2", 10.001, 10.001, true).await;
    service.shutdown().await;

    let response = service
        .handle_query(DispatchQuery {
            origin_latitude: 10.0,
            origin_longitude: 10.0,
            deadline_ms: 500,
        })
        .await;
    assert_eq!(
        response,
        DispatchResponse::failed(DispatchFailure::NoAgentAvailable)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn later_report_wins_for_any_pool_size() {
    for workers in [1, 8] {
        let store = Arc::new(MemoryLocationStore::new());
        let service = DispatchService::start(&config(true, workers), store.clone())
            .await
            .unwrap();

        for step in 0..50 {
            let lat = 40.0 + step as f64 * 0.01;
            report(&service, "cab-1", lat, -74.0, false).await;
            report(&service, "cab-2", -lat, 74.0, false).await;
        }
        service.shutdown().await;

        let last = Position::new(40.0 + 49.0 * 0.01, -74.0);
        assert_eq!(store.get("cab-1").await.unwrap().unwrap().position, last);

        let index = service.index().unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.cell_of("cab-1"), Some(index.map_to_grid(last)));
        assert_eq!(
            service.find_nearest_available(last, soon()).await.unwrap(),
            "cab-1"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_fallback_agrees_with_index() {
    let store = Arc::new(MemoryLocationStore::new());
    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..2_000 {
        let position = Position::new(rng.gen_range(48.0..49.0), rng.gen_range(2.0..3.0));
        let engaged = rng.gen_bool(0.3);
        store
            .put(AgentRecord::new(format!("cab-{:04}", i), position, engaged))
            .await
            .unwrap();
    }

    let indexed = DispatchService::start(&config(true, 2), store.clone())
        .await
        .unwrap();
    let scanning = DispatchService::start(&config(false, 2), store.clone())
        .await
        .unwrap();
    assert!(indexed.has_warm_index());
    assert!(!scanning.has_warm_index());
    assert_eq!(indexed.index().unwrap().len(), 2_000);

    for _ in 0..50 {
        let origin = Position::new(rng.gen_range(48.0..49.0), rng.gen_range(2.0..3.0));
        let a = indexed.find_nearest_available(origin, soon()).await.unwrap();
        let b = scanning.find_nearest_available(origin, soon()).await.unwrap();
        assert_eq!(a, b, "origin {:?}", origin);
    }
}

#[tokio::test]
async fn expired_deadline_times_out() {
    let (_, service) = node(true).await;
    report(&service, "cab-1", 1.0, 1.0, false).await;
    service.shutdown().await;

    assert!(matches!(
        service
            .find_nearest_available(Position::new(1.0, 1.0), Instant::now())
            .await,
        Err(DispatchError::Timeout)
    ));

    let slow = DispatchService::start(&config(false, 1), Arc::new(SlowStore))
        .await
        .unwrap();
    let response = slow
        .handle_query(DispatchQuery {
            origin_latitude: 1.0,
            origin_longitude: 1.0,
            deadline_ms: 20,
        })
        .await;
    assert_eq!(response, DispatchResponse::failed(DispatchFailure::Timeout));
}

#[tokio::test]
async fn store_outage_is_reported_not_hidden() {
    let service = DispatchService::start(&config(true, 1), Arc::new(DownStore))
        .await
        .unwrap();
    // Warm-up failed, so queries go to the store.
    assert!(!service.has_warm_index());

    let response = service
        .handle_query(DispatchQuery {
            origin_latitude: 0.0,
            origin_longitude: 0.0,
            deadline_ms: 200,
        })
        .await;
    assert_eq!(
        response,
        DispatchResponse::failed(DispatchFailure::StoreUnavailable)
    );

    // Updates are accepted; applying them fails inside the worker.
    report(&service, "cab-1", 0.0, 0.0, false).await;
    service.shutdown().await;
    assert_eq!(service.stats().pipeline.failed, 1);
}

#[tokio::test]
async fn invalid_input_is_rejected_up_front() {
    let (_, service) = node(true).await;

    let err = service
        .report_position("cab-1", Position::new(91.0, 0.0), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));

    let err = service
        .handle_report(PositionReport {
            agent_id: "".into(),
            latitude: 1.0,
            longitude: 1.0,
            engaged: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
    assert_eq!(service.stats().pipeline.rejected, 2);

    for query in [
        DispatchQuery {
            origin_latitude: 0.0,
            origin_longitude: 200.0,
            deadline_ms: 100,
        },
        DispatchQuery {
            origin_latitude: 0.0,
            origin_longitude: 0.0,
            deadline_ms: 0,
        },
    ] {
        assert_eq!(
            service.handle_query(query).await,
            DispatchResponse::failed(DispatchFailure::InvalidRequest)
        );
    }
}

#[tokio::test]
async fn wire_round_trip_through_the_service() {
    let (_, service) = node(true).await;

    let report: PositionReport = serde_json::from_str(
        r#"{"cab_id": "cab-9", "latitude": 52.52, "longitude": 13.405}"#,
    )
    .unwrap();
    let ack = service.handle_report(report).await.unwrap();
    assert_eq!(ack, UpdateAck::accepted());
    service.shutdown().await;

    let query: DispatchQuery =
        serde_json::from_str(r#"{"start_latitude": 52.5, "start_longitude": 13.4}"#).unwrap();
    let response = service.handle_query(query).await;
    assert_eq!(
        serde_json::to_string(&response).unwrap(),
        r#"{"agent_id":"cab-9"}"#
    );
}

#[tokio::test]
async fn stale_agents_are_evicted_from_store_and_index() {
    let store = Arc::new(MemoryLocationStore::new());
    let mut stale = AgentRecord::new("ghost", Position::new(40.0, -74.0), false);
    stale.updated_at = Utc::now() - chrono::Duration::hours(1);
    store.put(stale).await.unwrap();
    store
        .put(AgentRecord::new("fresh", Position::new(40.5, -74.0), false))
        .await
        .unwrap();

    let service = DispatchService::start(&config(true, 1), store.clone())
        .await
        .unwrap();
    assert_eq!(service.index().unwrap().len(), 2);
    assert_eq!(
        service
            .find_nearest_available(Position::new(40.0, -74.0), soon())
            .await
            .unwrap(),
        "ghost"
    );

    assert_eq!(service.evict_stale().await.unwrap(), 1);
    assert!(store.get("ghost").await.unwrap().is_none());
    assert_eq!(service.index().unwrap().len(), 1);
    assert_eq!(
        service
            .find_nearest_available(Position::new(40.0, -74.0), soon())
            .await
            .unwrap(),
        "fresh"
    );
    assert_eq!(service.evict_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn sweeper_evicts_in_the_background() {
    let store = Arc::new(MemoryLocationStore::new());
    let mut stale = AgentRecord::new("ghost", Position::new(1.0, 1.0), false);
    stale.updated_at = Utc::now() - chrono::Duration::hours(1);
    store.put(stale).await.unwrap();

    let service = Arc::new(
        DispatchService::start(&config(true, 1), store.clone())
            .await
            .unwrap(),
    );
    let sweeper = StaleSweeper::spawn(service.clone(), Duration::from_millis(10));

    let mut waited = Duration::ZERO;
    while !store.is_empty() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert!(store.is_empty());
    assert!(service.index().unwrap().is_empty());

    sweeper.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sweeper.is_running());
}

#[tokio::test]
async fn local_node_only_tracks_its_service_area() {
    let mut local = config(true, 2);
    local.node.name = "downtown".into();
    local.service_area = Some(ServiceArea {
        latitude: 40.0,
        longitude: -74.0,
        radius_km: 20.0,
    });
    let store = Arc::new(MemoryLocationStore::new());
    let service = DispatchService::start(&local, store.clone()).await.unwrap();

    report(&service, "inside", 40.05, -74.05, false).await;
    report(&service, "outside", 42.0, -74.0, false).await;
    service.shutdown().await;

    assert!(store.get("outside").await.unwrap().is_none());
    let stats = service.stats();
    assert_eq!(stats.node, "downtown");
    assert_eq!(stats.indexed_agents, 1);
    assert_eq!(stats.pipeline.applied, 1);
    assert_eq!(stats.pipeline.filtered, 1);
}

#[tokio::test]
async fn from_config_uses_memory_store_by_default() {
    let service = DispatchService::from_config(&FleetConfig::default())
        .await
        .unwrap();
    assert_eq!(service.store().backend(), "memory");
    assert!(service.has_warm_index());
    assert_eq!(service.warm_up().await.unwrap(), 0);
}

#[tokio::test]
async fn agent_beyond_search_radius_is_not_found_on_either_path() {
    let store = Arc::new(MemoryLocationStore::new());
    store
        .put(AgentRecord::new("far", Position::new(41.0, -74.0), false))
        .await
        .unwrap();

    let indexed = DispatchService::start(&config(true, 1), store.clone())
        .await
        .unwrap();
    let scanning = DispatchService::start(&config(false, 1), store.clone())
        .await
        .unwrap();
    let origin = Position::new(40.0, -74.0);
    for service in [&indexed, &scanning] {
        assert!(matches!(
            service.find_nearest_available(origin, soon()).await,
            Err(DispatchError::NotFound)
        ));
    }

    // Inside the window both paths find it again.
    let near = Position::new(40.9, -74.0);
    assert_eq!(indexed.find_nearest_available(near, soon()).await.unwrap(), "far");
    assert_eq!(scanning.find_nearest_available(near, soon()).await.unwrap(), "far");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_during_warm_up_is_not_lost() {
    let inner = Arc::new(MemoryLocationStore::new());
    inner
        .put(AgentRecord::new("cab-1", Position::new(40.0, -74.0), false))
        .await
        .unwrap();
    let store = Arc::new(HookedStore::new(inner.clone()));
    let service = Arc::new(
        DispatchService::start(&config(true, 2), store.clone())
            .await
            .unwrap(),
    );

    store.pause_next_scan.store(true, Ordering::SeqCst);
    let warming = {
        let service = service.clone();
        tokio::spawn(async move { service.warm_up().await })
    };
    store.scanned.notified().await;

    // The old position is already in the warm-up snapshot.
    report(&service, "cab-1", 45.0, -70.0, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.resume.notify_one();
    assert_eq!(warming.await.unwrap().unwrap(), 1);
    service.shutdown().await;

    let moved = Position::new(45.0, -70.0);
    assert_eq!(inner.get("cab-1").await.unwrap().unwrap().position, moved);
    let index = service.index().unwrap();
    assert_eq!(index.cell_of("cab-1"), Some(index.map_to_grid(moved)));
    assert_eq!(service.find_nearest_available(moved, soon()).await.unwrap(), "cab-1");
}

#[tokio::test]
async fn report_landing_mid_sweep_survives_eviction() {
    let inner = Arc::new(MemoryLocationStore::new());
    let mut stale = AgentRecord::new("cab-1", Position::new(40.0, -74.0), false);
    stale.updated_at = Utc::now() - chrono::Duration::hours(1);
    inner.put(stale).await.unwrap();
    let store = Arc::new(HookedStore::new(inner.clone()));
    let service = DispatchService::start(&config(true, 1), store.clone())
        .await
        .unwrap();

    // The sweep's snapshot shows the stale record; a fresh one lands right after.
    let fresh = AgentRecord::new("cab-1", Position::new(40.01, -74.0), false);
    *store.write_after_scan.lock() = Some(fresh.clone());
    assert_eq!(service.evict_stale().await.unwrap(), 0);
    assert_eq!(inner.get("cab-1").await.unwrap(), Some(fresh));
}

#[tokio::test]
async fn index_drops_agents_the_store_expired() {
    let store = Arc::new(MemoryLocationStore::new());
    let mut stale = AgentRecord::new("expired", Position::new(1.0, 1.0), false);
    stale.updated_at = Utc::now() - chrono::Duration::hours(1);
    store.put(stale).await.unwrap();
    let service = DispatchService::start(&config(true, 1), store.clone())
        .await
        .unwrap();
    assert_eq!(service.index().unwrap().len(), 1);

    // Gone from the store without going through eviction, as a key TTL does.
    store.delete("expired").await.unwrap();
    assert_eq!(service.evict_stale().await.unwrap(), 0);
    assert!(service.index().unwrap().is_empty());
}
