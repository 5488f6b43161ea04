//! Redis Backend
//!
//! Remote key-value store backend. Expiry is left to Redis (`PX`), batch
//! writes go through a pipeline, and tags live in an auxiliary set under
//! `"<key>:tags"` that carries the same TTL as its key.
//!
//! The `:tags` suffix is reserved only for those auxiliary sets. A user key
//! such as `report:tags` is a plain string and is listed like any other
//! key; listings tell the two apart by Redis type. Writing a tagged value
//! under `report` replaces a string stored under `report:tags`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::backend::{BackendKind, BackendStats, CacheBackend};
use crate::cache::codec;
use crate::cache::pattern::KeyPattern;
use crate::error::{CacheError, Result};

const TAGS_SUFFIX: &str = ":tags";
const SCAN_BATCH: usize = 500;
const DELETE_BATCH: usize = 500;

fn tags_key(key: &str) -> String {
    format!("{}{}", key, TAGS_SUFFIX)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

// == Redis Backend ==
/// Backend over a single Redis instance.
pub struct RedisBackend {
    connection: ConnectionManager,
    /// Applied to every round trip
    timeout: Duration,
    max_item_size: usize,
    closed: AtomicBool,
}

impl RedisBackend {
    /// Connects and verifies the server answers `PING`.
    pub async fn connect(url: &str, timeout: Duration, max_item_size: usize) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::BackendUnavailable(format!("redis connect to {} timed out", url)))??;

        let backend = Self {
            connection,
            timeout,
            max_item_size,
            closed: AtomicBool::new(false),
        };

        let mut conn = backend.conn()?;
        backend
            .run("ping", redis::cmd("PING").query_async::<()>(&mut conn))
            .await?;

        info!(url = %url, "Redis backend connected");
        Ok(backend)
    }

    fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::BackendUnavailable("redis backend is shut down".into()));
        }
        Ok(self.connection.clone())
    }

    /// Runs one round trip under the backend timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::BackendUnavailable(format!(
                "redis {} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }

    fn encode_checked(&self, key: &str, value: &Value) -> Result<Vec<u8>> {
        let bytes = codec::encode(value)?;
        let size = key.len() + bytes.len();
        if size > self.max_item_size {
            return Err(CacheError::ItemTooLarge {
                key: key.to_string(),
                size,
                max: self.max_item_size,
            });
        }
        Ok(bytes)
    }

    /// Queues the commands that write one key and replace its tag set.
    fn queue_write(
        pipe: &mut redis::Pipeline,
        key: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[String],
    ) {
        let tag_key = tags_key(key);
        match ttl {
            Some(ttl) => pipe
                .cmd("SET")
                .arg(key)
                .arg(bytes)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .ignore(),
            None => pipe.cmd("SET").arg(key).arg(bytes).ignore(),
        };
        pipe.cmd("DEL").arg(&tag_key).ignore();
        if !tags.is_empty() {
            pipe.cmd("SADD").arg(&tag_key).arg(tags).ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(&tag_key).arg(ttl_millis(ttl)).ignore();
            }
        }
    }

    /// Full SCAN for a raw Redis glob, deduplicated.
    async fn scan(&self, glob: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn()?;
        let mut cursor: u64 = 0;
        let mut found = BTreeSet::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(glob)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found)
    }

    /// Keeps the `candidates` whose Redis `TYPE` is `kind`.
    async fn of_type(&self, candidates: Vec<String>, kind: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let mut kept = Vec::new();

        for chunk in candidates.chunks(SCAN_BATCH) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.cmd("TYPE").arg(key);
            }
            let types: Vec<String> = self.run("type", pipe.query_async(&mut conn)).await?;
            kept.extend(
                chunk
                    .iter()
                    .zip(types)
                    .filter(|(_, found)| found == kind)
                    .map(|(key, _)| key.clone()),
            );
        }

        Ok(kept)
    }

    /// Deletes keys and their tag sets, returning how many keys existed.
    async fn delete_keys(&self, keys: &[String]) -> Result<usize> {
        let mut conn = self.conn()?;
        let mut removed = 0usize;

        for chunk in keys.chunks(DELETE_BATCH) {
            let tag_keys: Vec<String> = chunk.iter().map(|k| tags_key(k)).collect();
            let mut pipe = redis::pipe();
            pipe.cmd("DEL").arg(chunk);
            pipe.cmd("DEL").arg(&tag_keys).ignore();
            let (count,): (usize,) = self.run("del", pipe.query_async(&mut conn)).await?;
            removed += count;
        }

        Ok(removed)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn has_native_ttl(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn()?;
        let raw: Option<Vec<u8>> = self
            .run("get", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        raw.map(|bytes| codec::decode(&bytes)).transpose()
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<()> {
        let bytes = self.encode_checked(key, &value)?;
        let mut pipe = redis::pipe();
        Self::queue_write(&mut pipe, key, bytes, ttl, &tags);

        let mut conn = self.conn()?;
        self.run("set", pipe.query_async::<()>(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.delete_keys(&[key.to_string()]).await? > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let count: i64 = self
            .run("exists", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await?;
        Ok(count > 0)
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.conn()?;
        let raw: Vec<Option<Vec<u8>>> = self
            .run("mget", redis::cmd("MGET").arg(keys).query_async(&mut conn))
            .await?;

        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, bytes)| {
                let value = bytes.and_then(|b| match codec::decode(&b) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(key = %key, error = %err, "Undecodable value in batch read");
                        None
                    }
                });
                (key.clone(), value)
            })
            .collect())
    }

    async fn mset(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
        tags: HashMap<String, Vec<String>>,
    ) -> Result<bool> {
        let mut all_written = true;
        let mut pipe = redis::pipe();
        let mut queued = 0usize;

        for (key, value) in &items {
            match self.encode_checked(key, value) {
                Ok(bytes) => {
                    let item_tags = tags.get(key).map(Vec::as_slice).unwrap_or(&[]);
                    Self::queue_write(&mut pipe, key, bytes, ttl, item_tags);
                    queued += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping item in batch write");
                    all_written = false;
                }
            }
        }

        if queued > 0 {
            let mut conn = self.conn()?;
            self.run("mset", pipe.query_async::<()>(&mut conn)).await?;
        }
        Ok(all_written)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = KeyPattern::new(pattern)?;
        let found = self.scan(&pattern.to_redis_glob()).await?;
        let (suffixed, mut keys): (Vec<String>, Vec<String>) =
            found.into_iter().partition(|key| key.ends_with(TAGS_SUFFIX));
        keys.extend(self.of_type(suffixed, "string").await?);
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self, pattern: &str) -> Result<usize> {
        let keys = self.keys(pattern).await?;
        self.delete_keys(&keys).await
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }

        let candidates = self.scan(&format!("*{}", TAGS_SUFFIX)).await?;
        let tag_sets = self.of_type(candidates.into_iter().collect(), "set").await?;
        let mut conn = self.conn()?;
        let mut doomed = Vec::new();

        for chunk in tag_sets.chunks(SCAN_BATCH) {
            let mut pipe = redis::pipe();
            for tag_key in chunk {
                pipe.cmd("SMEMBERS").arg(tag_key);
            }
            let members: Vec<Vec<String>> =
                self.run("smembers", pipe.query_async(&mut conn)).await?;

            for (tag_key, item_tags) in chunk.iter().zip(members) {
                if item_tags.iter().any(|t| tags.contains(t)) {
                    if let Some(key) = tag_key.strip_suffix(TAGS_SUFFIX) {
                        doomed.push(key.to_string());
                    }
                }
            }
        }

        self.delete_keys(&doomed).await
    }

    async fn stats(&self) -> Result<BackendStats> {
        let mut conn = self.conn()?;
        let info: String = self
            .run("info", redis::cmd("INFO").query_async(&mut conn))
            .await?;
        let dbsize: u64 = self
            .run("dbsize", redis::cmd("DBSIZE").query_async(&mut conn))
            .await?;

        let info = parse_info(&info);
        let used = info.get("used_memory").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let limit = info.get("maxmemory").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

        let mut stats = BackendStats::new(BackendKind::Redis);
        stats.item_count = dbsize;
        stats.memory_bytes = used;
        if limit > 0 {
            stats.max_bytes = Some(limit);
            stats.usage_percent = Some(used as f64 / limit as f64 * 100.0);
        }
        stats.evictions = info.get("evicted_keys").and_then(|v| v.parse().ok()).unwrap_or(0);
        stats.expired = info.get("expired_keys").and_then(|v| v.parse().ok()).unwrap_or(0);
        for field in ["redis_version", "connected_clients", "used_memory_human"] {
            if let Some(value) = info.get(field) {
                stats.details.insert(field.to_string(), Value::from(value.clone()));
            }
        }
        Ok(stats)
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Redis backend closed");
        }
        Ok(())
    }
}

/// Parses the `field:value` lines of an `INFO` reply.
fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
