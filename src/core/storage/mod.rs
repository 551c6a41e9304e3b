//! Storage backends for last-known agent positions
//!
//! Provides pluggable location stores:
//! - In-process (DashMap, sharded)
//! - DragonflyDB / Redis (shared between central and cluster nodes)

pub mod dragonfly;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use chrono::{DateTime, Utc};

use crate::core::config::{StoreBackend, StoreConfig};
use crate::fleet::AgentRecord;

pub use dragonfly::RedisLocationStore;
pub use memory::MemoryLocationStore;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// Backing service unreachable after retries.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt value under {key}: {value:?}")]
    Corrupt { key: String, value: String },

    #[error("store operation failed: {0}")]
    OperationFailed(String),
}

/// Concurrency-safe `agent_id -> AgentRecord` mapping, the source of truth
/// every index is derived from.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>>;

    /// Replaces the agent's record. Replaying the same record is harmless.
    async fn put(&self, record: AgentRecord) -> StorageResult<()>;

    /// Every record present for the whole duration of the scan, at most
    /// once per agent. Records written or deleted while the scan runs may
    /// or may not appear, and each one is whichever version the scan read.
    /// Backends walk their shards or cursor incrementally; there is no
    /// point-in-time view across agents.
    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>>;

    async fn delete(&self, agent_id: &str) -> StorageResult<()>;

    /// Atomically deletes the agent only if its stored `updated_at` is older
    /// than `cutoff`, returning the removed record. A record refreshed after
    /// the caller looked at it survives.
    async fn remove_if_older(
        &self,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Builds the store selected by `config`. Redis connects lazily on first use.
pub fn connect(config: &StoreConfig) -> Arc<dyn LocationStore> {
    let store: Arc<dyn LocationStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryLocationStore::new()),
        StoreBackend::Redis => Arc::new(RedisLocationStore::new(config)),
    };
    info!("[Storage] Using {} location store", store.backend());
    store
}
