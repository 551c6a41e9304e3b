use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::fleet::grid::{self, MAX_SEARCH_RINGS, MIN_CELL_SIZE_DEG};
use crate::fleet::{geo, Position};

/// Identity of the node serving this replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Nodes without an index answer queries by scanning the store.
    pub index_enabled: bool,
}

/// Spatial grid parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cell edge in degrees. 0.01° is roughly 1.1 km north-south.
    pub cell_size_deg: f64,
    /// Number of rings searched around the origin cell before giving up.
    pub max_search_radius: u32,
    /// Lock shards the cells are spread across.
    pub lock_shards: usize,
}

/// Ingestion worker pool
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: usize,
    /// Capacity of each worker lane.
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Location store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Circular area a cluster node is responsible for.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceArea {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

impl ServiceArea {
    pub fn center(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }

    pub fn contains(&self, position: Position) -> bool {
        geo::distance(self.center(), position) <= self.radius_km
    }
}

/// Top-level settings for a dispatch node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub node: NodeConfig,
    pub grid: GridConfig,
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub service_area: Option<ServiceArea>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "central".to_string(),
            index_enabled: true,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            cell_size_deg: 0.01,
            max_search_radius: 64,
            lock_shards: 64,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            workers: 4,
            queue_capacity: 1024,
            enqueue_timeout_ms: 250,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "agent:".to_string(),
            max_retries: 3,
            retry_backoff_ms: 50,
            stale_after_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl IngestConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

impl GridConfig {
    /// Whether `p` is within `max_search_radius` rings of `origin`'s cell.
    /// Both the index search and the scan fallback give up beyond this.
    pub fn within_search_radius(&self, origin: Position, p: Position) -> bool {
        let cell_size = grid::effective_cell_size(self.cell_size_deg);
        let rings = self.max_search_radius.min(MAX_SEARCH_RINGS);
        grid::ring_distance(cell_size, origin, p) <= u64::from(rings)
    }
}

impl StoreConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl FleetConfig {
    /// Parse and validate a JSON document. Missing sections take defaults.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: FleetConfig =
            serde_json::from_str(raw).context("failed to parse fleet config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let grid = &self.grid;
        if !grid.cell_size_deg.is_finite() || grid.cell_size_deg < MIN_CELL_SIZE_DEG {
            bail!(
                "grid.cell_size_deg must be at least {}, got {}",
                MIN_CELL_SIZE_DEG,
                grid.cell_size_deg
            );
        }
        if grid.max_search_radius > MAX_SEARCH_RINGS {
            bail!(
                "grid.max_search_radius must not exceed {}, got {}",
                MAX_SEARCH_RINGS,
                grid.max_search_radius
            );
        }
        if grid.cell_size_deg > 180.0 {
            bail!("grid.cell_size_deg must not exceed 180, got {}", grid.cell_size_deg);
        }
        if grid.lock_shards == 0 {
            bail!("grid.lock_shards must be at least 1");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be at least 1");
        }
        if self.ingest.queue_capacity == 0 {
            bail!("ingest.queue_capacity must be at least 1");
        }
        if self.store.key_prefix.is_empty() {
            bail!("store.key_prefix must not be empty");
        }
        if self.store.stale_after_secs == 0 {
            bail!("store.stale_after_secs must be at least 1");
        }
        if let Some(area) = &self.service_area {
            Position::validated(area.latitude, area.longitude)
                .context("service_area center is not a valid position")?;
            if !area.radius_km.is_finite() || area.radius_km <= 0.0 {
                bail!("service_area.radius_km must be positive, got {}", area.radius_km);
            }
        }
        Ok(())
    }
}
