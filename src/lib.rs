//! FleetGrid Core - Real-Time Nearest-Agent Dispatch
//!
//! Tracks the last known position of every agent in a fleet and answers
//! "nearest available agent to this point" queries. Position updates flow
//! through a bounded ingestion pipeline into a shared location store and an
//! in-memory grid index; queries read the index when it is warm and fall
//! back to a scan of the store otherwise.

pub mod core;
pub mod dispatch;
pub mod fleet;
pub mod ingest;

// Re-export key types
pub use crate::core::config::{FleetConfig, GridConfig, IngestConfig, ServiceArea, StoreConfig};
pub use crate::core::error::{DispatchError, DispatchResult, ValidationError};
pub use crate::core::storage::{LocationStore, MemoryLocationStore, RedisLocationStore, StorageError};
pub use dispatch::{
    DispatchFailure, DispatchQuery, DispatchResponse, DispatchService, DispatchStats,
    PositionReport, StaleSweeper, UpdateAck,
};
pub use fleet::{AgentRecord, Position, SpatialIndex};
pub use ingest::{IngestionPipeline, PositionEvent};

/// Initializes the global tracing subscriber. `level` is an env-filter
/// directive such as `"info"` or `"fleetgrid_core=debug"`.
pub fn setup_logging(level: Option<String>) {
    let filter = level.unwrap_or_else(|| "info".to_string());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
