// grid.rs — Sharded grid index over live agent positions.
//
// Cell = cell_size° × cell_size° square keyed by (floor(lon/size), floor(lat/size)).
// Cells are spread over lock shards with Fibonacci hashing (Knuth), so writers
// for different agents rarely touch the same lock.
// Search: Chebyshev rings around the origin cell, widening until the best match
// is provably closer than anything in the unsearched rings.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use thiserror::Error;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::geo::{self, EARTH_RADIUS_KM};
use super::{AgentRecord, Position};
use crate::core::config::GridConfig;

/// Integer cell coordinates `(x, y)` = (longitude bucket, latitude bucket).
pub type CellKey = (i32, i32);

/// Smallest cell edge the grid accepts. Keeps `360 / cell` plus the widest
/// ring inside `i32` cell coordinates.
pub const MIN_CELL_SIZE_DEG: f64 = 1e-6;

/// Upper bound on `max_search_radius`.
pub const MAX_SEARCH_RINGS: u32 = 1 << 20;

/// Cell size actually used for `requested`: non-finite or too-small values
/// fall back to [`MIN_CELL_SIZE_DEG`], anything wider than 180° is capped.
pub fn effective_cell_size(requested: f64) -> f64 {
    if requested.is_finite() && requested >= MIN_CELL_SIZE_DEG {
        requested.min(180.0)
    } else {
        MIN_CELL_SIZE_DEG
    }
}

/// Chebyshev distance, in cells, between the cells holding `a` and `b`.
pub fn ring_distance(cell_size: f64, a: Position, b: Position) -> u64 {
    let bucket = |deg: f64| (deg / cell_size).floor() as i64;
    let dx = bucket(a.longitude).abs_diff(bucket(b.longitude));
    let dy = bucket(a.latitude).abs_diff(bucket(b.latitude));
    dx.max(dy)
}

/// The search ran past the caller's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("search deadline exceeded after {rings} rings")]
pub struct DeadlineExceeded {
    pub rings: u32,
}

/// Winner of a nearest-agent search.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestMatch {
    pub agent_id: String,
    pub distance_km: f64,
}

impl NearestMatch {
    /// Total order used by every search path: distance first, then agent id.
    #[inline]
    pub fn beats(&self, other: &NearestMatch) -> bool {
        self.distance_km < other.distance_km
            || (self.distance_km == other.distance_km && self.agent_id < other.agent_id)
    }

    pub fn closer_of(a: NearestMatch, b: NearestMatch) -> NearestMatch {
        if b.beats(&a) {
            b
        } else {
            a
        }
    }
}

/// Agents currently bucketed in one cell, with the snapshot the search reads.
#[derive(Debug, Default)]
struct GridCell {
    members: BTreeMap<String, AgentRecord>,
}

type Shard = HashMap<CellKey, GridCell>;

/// Grid-bucketed index of agent positions.
///
/// Every indexed agent lives in exactly one cell, the one its latest position
/// maps to. Moves between cells hold both affected shard locks, so a search
/// never sees an agent in two cells or a snapshot filed under the wrong cell.
pub struct SpatialIndex {
    cell_size: f64,
    max_search_radius: u32,
    shards: Vec<RwLock<Shard>>,
    /// agent_id -> cell it is filed under. The entry guard also serializes
    /// writers for the same agent.
    placements: DashMap<String, CellKey>,
}

impl SpatialIndex {
    pub fn new(cell_size: f64, max_search_radius: u32, lock_shards: usize) -> Self {
        let lock_shards = lock_shards.max(1);
        let requested = cell_size;
        let cell_size = effective_cell_size(requested);
        if cell_size != requested {
            warn!(
                "[SpatialIndex] cell size {}° out of range, using {}°",
                requested, cell_size
            );
        }
        let max_search_radius = max_search_radius.min(MAX_SEARCH_RINGS);
        info!(
            "[SpatialIndex] cell={}°, max radius={} rings, {} lock shards",
            cell_size, max_search_radius, lock_shards
        );
        SpatialIndex {
            cell_size,
            max_search_radius,
            shards: (0..lock_shards).map(|_| RwLock::new(HashMap::new())).collect(),
            placements: DashMap::new(),
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(
            config.cell_size_deg,
            config.max_search_radius,
            config.lock_shards,
        )
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn max_search_radius(&self) -> u32 {
        self.max_search_radius
    }

    /// Whether `p` lies within `max_search_radius` rings of `origin`'s cell,
    /// i.e. whether [`find_nearest`](Self::find_nearest) can ever reach it.
    pub fn within_search_window(&self, origin: Position, p: Position) -> bool {
        ring_distance(self.cell_size, origin, p) <= u64::from(self.max_search_radius)
    }

    #[inline(always)]
    pub fn map_to_grid(&self, p: Position) -> CellKey {
        let cx = (p.longitude / self.cell_size).floor() as i32;
        let cy = (p.latitude / self.cell_size).floor() as i32;
        (cx, cy)
    }

    /// Fibonacci hash of the cell coordinates onto a lock shard.
    #[inline(always)]
    fn shard_of(&self, key: CellKey) -> usize {
        let mixed = (key.0 as u32 as u64).wrapping_mul(2654435761)
            ^ (key.1 as u32 as u64).wrapping_mul(2246822519);
        ((mixed.wrapping_mul(11400714819323198485) >> 32) as usize) % self.shards.len()
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Files `record` under the cell its position maps to.
    ///
    /// `old` is the position the caller last saw for this agent. The index
    /// keeps its own placement and trusts it when the two disagree.
    pub fn upsert(&self, agent_id: &str, old: Option<Position>, record: AgentRecord) {
        let target = self.map_to_grid(record.position);
        let hinted = old.map(|p| self.map_to_grid(p));

        match self.placements.entry(agent_id.to_owned()) {
            Entry::Vacant(slot) => {
                if hinted.is_some() {
                    debug!("[SpatialIndex] {} had no placement, inserting fresh", agent_id);
                }
                let mut shard = self.shards[self.shard_of(target)].write();
                shard
                    .entry(target)
                    .or_default()
                    .members
                    .insert(agent_id.to_owned(), record);
                drop(shard);
                slot.insert(target);
            }
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                if hinted.is_some_and(|h| h != current) {
                    debug!(
                        "[SpatialIndex] stale previous position for {}: hinted {:?}, filed {:?}",
                        agent_id, hinted, current
                    );
                }
                if current == target {
                    let mut shard = self.shards[self.shard_of(target)].write();
                    shard
                        .entry(target)
                        .or_default()
                        .members
                        .insert(agent_id.to_owned(), record);
                } else {
                    self.move_between(agent_id, current, target, record);
                    slot.insert(target);
                }
            }
        }
    }

    /// Deletes the agent from its cell. No-op when it isn't indexed.
    pub fn remove(&self, agent_id: &str, position: Position) {
        match self.placements.entry(agent_id.to_owned()) {
            Entry::Occupied(slot) => {
                let key = *slot.get();
                let mut shard = self.shards[self.shard_of(key)].write();
                Self::detach(&mut shard, key, agent_id);
                drop(shard);
                slot.remove();
            }
            Entry::Vacant(_) => {
                let key = self.map_to_grid(position);
                let mut shard = self.shards[self.shard_of(key)].write();
                Self::detach(&mut shard, key, agent_id);
            }
        }
    }

    /// Drops everything and re-files `records`. Any upsert that lands while
    /// this runs is lost, so callers must keep writers out until it returns.
    pub fn rebuild(&self, records: Vec<AgentRecord>) {
        self.placements.clear();
        for shard in &self.shards {
            shard.write().clear();
        }
        let count = records.len();
        records.into_par_iter().for_each(|record| {
            let agent_id = record.agent_id.clone();
            self.upsert(&agent_id, None, record);
        });
        info!(
            "[SpatialIndex] rebuilt from {} records into {} cells",
            count,
            self.cell_count()
        );
    }

    /// Removes every agent accepted by `eligible` whose indexed snapshot is
    /// older than `cutoff`. Returns how many were dropped.
    pub fn remove_older_than<F>(&self, cutoff: DateTime<Utc>, eligible: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let ids: Vec<String> = self
            .placements
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| eligible(id))
            .collect();
        let mut removed = 0;
        for agent_id in ids {
            let Entry::Occupied(slot) = self.placements.entry(agent_id) else {
                continue;
            };
            let key = *slot.get();
            let mut shard = self.shards[self.shard_of(key)].write();
            let stale = shard
                .get(&key)
                .and_then(|cell| cell.members.get(slot.key()))
                .map_or(true, |record| record.updated_at < cutoff);
            if stale {
                Self::detach(&mut shard, key, slot.key());
                drop(shard);
                slot.remove();
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("[SpatialIndex] dropped {} stale agents", removed);
        }
        removed
    }

    fn move_between(&self, agent_id: &str, from: CellKey, to: CellKey, record: AgentRecord) {
        let from_shard = self.shard_of(from);
        let to_shard = self.shard_of(to);

        if from_shard == to_shard {
            let mut shard = self.shards[from_shard].write();
            Self::detach(&mut shard, from, agent_id);
            shard
                .entry(to)
                .or_default()
                .members
                .insert(agent_id.to_owned(), record);
            return;
        }

        // Lock in shard order so concurrent moves can't deadlock.
        let (low, high) = (from_shard.min(to_shard), from_shard.max(to_shard));
        let mut low_guard = self.shards[low].write();
        let mut high_guard = self.shards[high].write();
        let (src, dst) = if from_shard < to_shard {
            (&mut *low_guard, &mut *high_guard)
        } else {
            (&mut *high_guard, &mut *low_guard)
        };
        Self::detach(src, from, agent_id);
        dst.entry(to)
            .or_default()
            .members
            .insert(agent_id.to_owned(), record);
    }

    fn detach(shard: &mut Shard, key: CellKey, agent_id: &str) {
        if let Some(cell) = shard.get_mut(&key) {
            cell.members.remove(agent_id);
            if cell.members.is_empty() {
                shard.remove(&key);
            }
        }
    }

    // ── Search ──────────────────────────────────────────────────────────────

    /// Nearest agent to `origin` whose record satisfies `predicate`.
    ///
    /// Returns `Ok(None)` when nothing matches within `max_search_radius`
    /// rings. Ties on distance go to the smaller agent id.
    pub fn find_nearest<P>(
        &self,
        origin: Position,
        predicate: P,
        deadline: Option<Instant>,
    ) -> Result<Option<NearestMatch>, DeadlineExceeded>
    where
        P: Fn(&AgentRecord) -> bool,
    {
        let center = self.map_to_grid(origin);
        let mut best: Option<NearestMatch> = None;

        for ring in 0..=self.max_search_radius {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DeadlineExceeded { rings: ring });
            }

            for key in ring_cells(center, ring as i32) {
                let shard = self.shards[self.shard_of(key)].read();
                let Some(cell) = shard.get(&key) else {
                    continue;
                };
                for (agent_id, record) in &cell.members {
                    if !predicate(record) {
                        continue;
                    }
                    let candidate = NearestMatch {
                        agent_id: agent_id.clone(),
                        distance_km: geo::distance(origin, record.position),
                    };
                    if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                        best = Some(candidate);
                    }
                }
            }

            if let Some(found) = &best {
                if found.distance_km < self.ring_lower_bound(origin, center, ring + 1) {
                    break;
                }
            }
        }

        Ok(best)
    }

    /// Lower bound, in km, on the distance from `origin` to any point in
    /// rings `>= ring` around `center`.
    ///
    /// A point outside the searched block is either `lat_gap` away in
    /// latitude (meridian arc) or `lon_gap` away in longitude. For the
    /// latter the haversine term is bounded using the widest latitude a
    /// point can reach without already being `lat_gap` away.
    fn ring_lower_bound(&self, origin: Position, center: CellKey, ring: u32) -> f64 {
        if ring == 0 {
            return 0.0;
        }
        let inner = ring as f64 - 1.0;
        let size = self.cell_size;

        let lon_low = (center.0 as f64 - inner) * size;
        let lon_high = (center.0 as f64 + inner + 1.0) * size;
        let lat_low = (center.1 as f64 - inner) * size;
        let lat_high = (center.1 as f64 + inner + 1.0) * size;

        let lon_gap = (origin.longitude - lon_low)
            .min(lon_high - origin.longitude)
            .max(0.0);
        let lat_gap = (origin.latitude - lat_low)
            .min(lat_high - origin.latitude)
            .max(0.0);

        let lat_gap_rad = lat_gap.to_radians();
        let by_latitude = EARTH_RADIUS_KM * lat_gap_rad;

        let phi = origin.latitude.to_radians().abs();
        let widest = (phi + lat_gap_rad).min(std::f64::consts::FRAC_PI_2);
        let spread = (phi.cos() * widest.cos()).max(0.0).sqrt();
        let half_lon = (lon_gap.to_radians().min(std::f64::consts::PI)) / 2.0;
        let by_longitude = 2.0 * EARTH_RADIUS_KM * (spread * half_lon.sin()).min(1.0).asin();

        by_latitude.min(by_longitude)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    /// Number of indexed agents.
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn cell_of(&self, agent_id: &str) -> Option<CellKey> {
        self.placements.get(agent_id).map(|c| *c)
    }

    /// Agent ids filed under `key`, in id order.
    pub fn agents_in_cell(&self, key: CellKey) -> Vec<String> {
        self.shards[self.shard_of(key)]
            .read()
            .get(&key)
            .map(|cell| cell.members.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Cells at Chebyshev distance exactly `ring` from `center`, row by row.
/// Cells whose coordinates would leave `i32` are skipped.
fn ring_cells(center: CellKey, ring: i32) -> impl Iterator<Item = CellKey> {
    let (cx, cy) = center;
    (-ring..=ring).flat_map(move |dy| {
        let step = if ring == 0 || dy.abs() == ring {
            1
        } else {
            (2 * ring) as usize
        };
        (-ring..=ring)
            .step_by(step)
            .filter_map(move |dx| Some((cx.checked_add(dx)?, cy.checked_add(dy)?)))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
