//! Cache Backend Contract
//!
//! Every storage engine implements [`CacheBackend`]. The engine is chosen once
//! at startup from configuration and never swapped at runtime.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::cache::{DocumentBackend, MemoryBackend, RedisBackend};
use crate::config::Config;
use crate::error::Result;

// == Backend Kind ==
/// Storage engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Size-bounded in-process map with eviction
    #[default]
    Memory,
    /// Remote key-value store with native TTL
    Redis,
    /// Persistent document table with an expiry index
    Document,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            "document" | "sqlite" => Ok(BackendKind::Document),
            _ => Err(format!("Unknown cache backend: {}", s)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Redis => write!(f, "redis"),
            BackendKind::Document => write!(f, "document"),
        }
    }
}

// == Backend Stats ==
/// Metrics reported by a backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub backend: BackendKind,
    pub item_count: u64,
    /// Approximate footprint in bytes
    pub memory_bytes: u64,
    /// Byte budget, if the backend enforces one
    pub max_bytes: Option<u64>,
    /// `memory_bytes / max_bytes` as a percentage
    pub usage_percent: Option<f64>,
    pub evictions: u64,
    pub expired: u64,
    /// Engine specific details
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl BackendStats {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            item_count: 0,
            memory_bytes: 0,
            max_bytes: None,
            usage_percent: None,
            evictions: 0,
            expired: 0,
            details: Map::new(),
        }
    }
}

// == Backend Trait ==
/// Uniform storage contract.
///
/// Reads never fail for a missing or expired key; they return `None`.
/// Writes replace tags wholesale.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the engine removes expired keys by itself.
    fn has_native_ttl(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<()>;

    /// Returns true iff the key existed and was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns one entry per requested key.
    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>>;

    /// Best-effort batch write. `Ok(false)` means some entries were not
    /// written; entries already written are kept.
    async fn mset(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
        tags: HashMap<String, Vec<String>>,
    ) -> Result<bool>;

    /// Keys matching a glob pattern. Callers cap the result.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Deletes every key matching `pattern`, returning the count removed.
    async fn clear(&self, pattern: &str) -> Result<usize>;

    /// Deletes every item carrying any of `tags`.
    async fn invalidate_tags(&self, tags: &[String]) -> Result<usize>;

    /// Physically removes expired items.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Runs policy eviction down to the target size.
    async fn evict_to_target(&self) -> Result<usize> {
        Ok(0)
    }

    async fn stats(&self) -> Result<BackendStats>;

    /// Releases resources. Safe to call more than once.
    async fn shutdown(&self) -> Result<()>;
}

// == Factory ==
/// Opens the backend selected by `config`.
///
/// Connection failures here are fatal to startup.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn CacheBackend>> {
    let backend: Arc<dyn CacheBackend> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new(
            config.max_cache_bytes(),
            config.max_item_bytes(),
            config.eviction_policy,
            Some(config.default_ttl()),
        )),
        BackendKind::Redis => Arc::new(
            RedisBackend::connect(
                &config.redis_url,
                config.backend_timeout(),
                config.max_item_bytes(),
            )
            .await?,
        ),
        BackendKind::Document => Arc::new(
            DocumentBackend::open(
                &config.document_path,
                config.max_item_bytes(),
                config.document_sweep_interval(),
            )
            .await?,
        ),
    };

    info!(backend = %config.backend, "Cache backend initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Redis".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Document);
        assert!("memcached".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_stats_details_are_flattened() {
        let mut stats = BackendStats::new(BackendKind::Memory);
        stats.details.insert("policy".into(), Value::from("lru"));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["policy"], "lru");
    }

    #[tokio::test]
    async fn test_open_memory_backend() {
        let backend = open_backend(&Config::default()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(!backend.has_native_ttl());
    }
}
