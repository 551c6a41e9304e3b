//! DragonflyDB/Redis location store
//!
//! Uses the redis crate which is compatible with DragonflyDB. The layout stays
//! readable by writers that only know the plain position convention:
//!
//! - `agent:<id>`     -> `"<latitude>,<longitude>"` (expires after the staleness window)
//! - `agent-engaged`  -> set of engaged agent ids (absent = available)
//! - `agent-seen`     -> hash of agent id -> last update, unix millis

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, RedisResult, Script};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{LocationStore, StorageError, StorageResult};
use crate::core::config::StoreConfig;
use crate::fleet::{AgentRecord, Position};

const SCAN_BATCH: usize = 500;

/// Deletes the agent only when its `seen` stamp is older than ARGV[2].
/// KEYS: position key, engaged set, seen hash. ARGV: agent id, cutoff millis.
const REMOVE_IF_OLDER: &str = r"
local seen = redis.call('HGET', KEYS[3], ARGV[1])
if not seen or tonumber(seen) >= tonumber(ARGV[2]) then
  return false
end
local raw = redis.call('GET', KEYS[1])
local engaged = redis.call('SISMEMBER', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return {raw or '', engaged, seen}
";

/// Drops metadata for an agent whose position key is gone (expired).
/// KEYS: position key, engaged set, seen hash. ARGV: agent id.
const DROP_ORPHAN: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
";

/// Redis-backed store shared between nodes.
pub struct RedisLocationStore {
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    url: String,
    key_prefix: String,
    engaged_set: String,
    seen_hash: String,
    ttl_secs: u64,
    max_retries: u32,
    retry_backoff: Duration,
    remove_if_older: Script,
    drop_orphan: Script,
}

impl RedisLocationStore {
    pub fn new(config: &StoreConfig) -> Self {
        let stem = config.key_prefix.trim_end_matches(':');
        RedisLocationStore {
            connection: Arc::new(RwLock::new(None)),
            url: config.redis_url.clone(),
            key_prefix: config.key_prefix.clone(),
            engaged_set: format!("{}-engaged", stem),
            seen_hash: format!("{}-seen", stem),
            ttl_secs: config.stale_after_secs,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            remove_if_older: Script::new(REMOVE_IF_OLDER),
            drop_orphan: Script::new(DROP_ORPHAN),
        }
    }

    fn key_for(&self, agent_id: &str) -> String {
        format!("{}{}", self.key_prefix, agent_id)
    }

    async fn get_connection(&self) -> StorageResult<ConnectionManager> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        {
            let mut conn = self.connection.write().await;
            *conn = Some(manager.clone());
        }

        info!("🐉 [RedisStore] Connected to {}", self.url);
        Ok(manager)
    }

    /// Runs `op` against a live connection, retrying transient failures with
    /// exponential backoff plus jitter.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match self.get_connection().await {
                Ok(conn) => op(conn).await.map_err(classify),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(StorageError::Unavailable(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "[RedisStore] {} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_retries, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(exp + jitter)
    }

    /// Clears engaged/seen entries left behind by position keys that expired.
    /// Each id is re-checked server-side, so an agent written meanwhile keeps
    /// its metadata.
    async fn drop_orphans(&self, ids: &[String]) -> StorageResult<()> {
        let mut dropped = 0u64;
        for agent_id in ids {
            let key = self.key_for(agent_id);
            let (key, script) = (key.as_str(), &self.drop_orphan);
            let (engaged_set, seen_hash) = (self.engaged_set.as_str(), self.seen_hash.as_str());
            let removed: i64 = self
                .with_retry("DROP_ORPHAN", move |mut conn| async move {
                    script
                        .key(key)
                        .key(engaged_set)
                        .key(seen_hash)
                        .arg(agent_id.as_str())
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;
            dropped += removed as u64;
        }
        if dropped > 0 {
            debug!("[RedisStore] dropped metadata for {} expired agents", dropped);
        }
        Ok(())
    }

    async fn scan_keys(&self) -> StorageResult<Vec<String>> {
        let pattern = format!("{}*", self.key_prefix);
        let pattern = pattern.as_str();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .with_retry("SCAN", move |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(
                batch
                    .into_iter()
                    .filter(|k| *k != self.engaged_set && *k != self.seen_hash),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Connection-level and server-busy errors are worth retrying; the rest are not.
fn classify(err: RedisError) -> StorageError {
    let transient = err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::ClusterDown
        );
    if transient {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::OperationFailed(err.to_string())
    }
}

/// `"<latitude>,<longitude>"` in plain decimal.
pub fn encode_position(position: Position) -> String {
    format!("{},{}", position.latitude, position.longitude)
}

pub fn decode_position(key: &str, raw: &str) -> StorageResult<Position> {
    let corrupt = || StorageError::Corrupt {
        key: key.to_string(),
        value: raw.to_string(),
    };
    let (lat, lon) = raw.split_once(',').ok_or_else(corrupt)?;
    let lat: f64 = lat.trim().parse().map_err(|_| corrupt())?;
    let lon: f64 = lon.trim().parse().map_err(|_| corrupt())?;
    Position::validated(lat, lon).map_err(|_| corrupt())
}

/// Ids carrying engaged/seen metadata but missing from `present`, sorted.
fn orphaned_ids(
    present: &HashSet<&str>,
    engaged: &HashSet<String>,
    seen: &HashMap<String, i64>,
) -> Vec<String> {
    let mut orphans: Vec<String> = engaged
        .iter()
        .chain(seen.keys())
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect();
    orphans.sort();
    orphans.dedup();
    orphans
}

fn decode_record(
    prefix: &str,
    key: &str,
    raw: &str,
    engaged: bool,
    seen_millis: Option<i64>,
) -> StorageResult<AgentRecord> {
    let agent_id = key.strip_prefix(prefix).unwrap_or(key);
    let position = decode_position(key, raw)?;
    // Records written by position-only writers carry no timestamp; treat them as fresh.
    let updated_at = seen_millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Ok(AgentRecord {
        agent_id: agent_id.to_string(),
        position,
        engaged,
        updated_at,
    })
}

#[async_trait]
impl LocationStore for RedisLocationStore {
    async fn get(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        let key = self.key_for(agent_id);
        let mut pipe = redis::pipe();
        pipe.get(&key)
            .sismember(&self.engaged_set, agent_id)
            .hget(&self.seen_hash, agent_id);
        let pipe = &pipe;

        let (raw, engaged, seen): (Option<String>, bool, Option<i64>) = self
            .with_retry("GET", move |mut conn| async move {
                pipe.query_async(&mut conn).await
            })
            .await?;

        match raw {
            Some(raw) => decode_record(&self.key_prefix, &key, &raw, engaged, seen).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, record: AgentRecord) -> StorageResult<()> {
        let key = self.key_for(&record.agent_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(&key, encode_position(record.position), self.ttl_secs)
            .ignore()
            .hset(
                &self.seen_hash,
                &record.agent_id,
                record.updated_at.timestamp_millis(),
            )
            .ignore();
        if record.engaged {
            pipe.sadd(&self.engaged_set, &record.agent_id).ignore();
        } else {
            pipe.srem(&self.engaged_set, &record.agent_id).ignore();
        }
        let pipe = &pipe;

        self.with_retry("PUT", move |mut conn| async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await?;
        debug!("[RedisStore] stored {}", key);
        Ok(())
    }

    async fn scan_all(&self) -> StorageResult<Vec<AgentRecord>> {
        let keys = self.scan_keys().await?;

        let engaged_set = self.engaged_set.as_str();
        let seen_hash = self.seen_hash.as_str();
        let (engaged, seen): (HashSet<String>, HashMap<String, i64>) = self
            .with_retry("SMEMBERS/HGETALL", move |mut conn| async move {
                redis::pipe()
                    .smembers(engaged_set)
                    .hgetall(seen_hash)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> = self
                .with_retry("MGET", move |mut conn| async move {
                    redis::cmd("MGET").arg(chunk).query_async(&mut conn).await
                })
                .await?;

            for (key, raw) in chunk.iter().zip(values) {
                // Expired between SCAN and MGET.
                let Some(raw) = raw else { continue };
                let agent_id = key.strip_prefix(&self.key_prefix).unwrap_or(key);
                let record = decode_record(
                    &self.key_prefix,
                    key,
                    &raw,
                    engaged.contains(agent_id),
                    seen.get(agent_id).copied(),
                );
                match record {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("[RedisStore] skipping {}: {}", key, e),
                }
            }
        }

        let present: HashSet<&str> = keys
            .iter()
            .map(|k| k.strip_prefix(&self.key_prefix).unwrap_or(k))
            .collect();
        let orphans = orphaned_ids(&present, &engaged, &seen);
        if !orphans.is_empty() {
            self.drop_orphans(&orphans).await?;
        }
        Ok(records)
    }

    async fn delete(&self, agent_id: &str) -> StorageResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.key_for(agent_id))
            .ignore()
            .srem(&self.engaged_set, agent_id)
            .ignore()
            .hdel(&self.seen_hash, agent_id)
            .ignore();
        let pipe = &pipe;

        self.with_retry("DEL", move |mut conn| async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn remove_if_older(
        &self,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<AgentRecord>> {
        let key = self.key_for(agent_id);
        let (key, script) = (key.as_str(), &self.remove_if_older);
        let (engaged_set, seen_hash) = (self.engaged_set.as_str(), self.seen_hash.as_str());
        let cutoff_millis = cutoff.timestamp_millis();

        let removed: Option<(String, i64, i64)> = self
            .with_retry("REMOVE_IF_OLDER", move |mut conn| async move {
                script
                    .key(key)
                    .key(engaged_set)
                    .key(seen_hash)
                    .arg(agent_id)
                    .arg(cutoff_millis)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        // An empty value means the position key had already expired.
        let Some((raw, engaged, seen)) = removed.filter(|(raw, _, _)| !raw.is_empty()) else {
            return Ok(None);
        };
        match decode_record(&self.key_prefix, key, &raw, engaged == 1, Some(seen)) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("[RedisStore] evicted undecodable {}: {}", key, e);
                Ok(None)
            }
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
