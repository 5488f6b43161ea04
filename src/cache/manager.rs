//! Cache Manager
//!
//! Façade over the one active backend. Adds metrics, fallback-on-miss and
//! tag invalidation, and turns backend failures into misses or `false` so a
//! cache outage never fails the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::backend::{BackendKind, BackendStats, CacheBackend};
use crate::cache::metrics::{CacheMetrics, MetricsSnapshot, Operation};
use crate::error::Result;

// == Key Ownership ==
/// Answers "does this node own key K". Implemented by the cluster layer.
pub trait KeyOwnership: Send + Sync {
    fn is_owner(&self, key: &str) -> bool;
}

// == Manager Stats ==
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub backend: Option<BackendStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub uptime_seconds: f64,
}

// == Cache Manager ==
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    metrics: Mutex<CacheMetrics>,
    ownership: RwLock<Option<Arc<dyn KeyOwnership>>>,
    started_at: Instant,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        info!(backend = %backend.kind(), "Cache manager initialized");
        Self {
            backend,
            metrics: Mutex::new(CacheMetrics::new()),
            ownership: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn has_native_ttl(&self) -> bool {
        self.backend.has_native_ttl()
    }

    // == Ownership ==
    /// Installs the ownership oracle consulted by [`CacheManager::owns`].
    pub fn attach_ownership(&self, oracle: Arc<dyn KeyOwnership>) {
        *self.ownership.write() = Some(oracle);
    }

    pub fn detach_ownership(&self) {
        *self.ownership.write() = None;
    }

    /// True when this node owns `key`, or when no oracle is attached.
    pub fn owns(&self, key: &str) -> bool {
        match self.ownership.read().as_ref() {
            Some(oracle) => oracle.is_owner(key),
            None => true,
        }
    }

    /// Times a backend call and records the outcome.
    async fn observe<T, F>(&self, op: Operation, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let mut metrics = self.metrics.lock();
        match &result {
            Ok(_) => metrics.record(op, start.elapsed()),
            Err(_) => metrics.record_error(op),
        }
        result
    }

    // == Get ==
    /// Returns the cached value, or `None` on miss or backend failure.
    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.observe(Operation::Get, self.backend.get(key)).await {
            Ok(Some(value)) => {
                self.metrics.lock().record_hit();
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                self.metrics.lock().record_miss();
                debug!(key = %key, "Cache miss");
                None
            }
            Err(err) => {
                self.metrics.lock().record_miss();
                error!(key = %key, error = %err, "Cache get error");
                None
            }
        }
    }

    // == Set ==
    /// Stores a value, surfacing the failure reason.
    pub async fn try_set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<()> {
        let result = self
            .observe(Operation::Set, self.backend.set(key, value, ttl, tags))
            .await;
        match &result {
            Ok(()) => debug!(key = %key, ttl = ?ttl, "Cache set"),
            Err(err) => error!(key = %key, error = %err, "Cache set error"),
        }
        result
    }

    /// Stores a value; `false` when the backend refused or failed.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> bool {
        self.try_set(key, value, ttl, tags).await.is_ok()
    }

    // == Delete ==
    pub async fn delete(&self, key: &str) -> bool {
        match self.observe(Operation::Delete, self.backend.delete(key)).await {
            Ok(removed) => {
                debug!(key = %key, removed, "Cache delete");
                removed
            }
            Err(err) => {
                error!(key = %key, error = %err, "Cache delete error");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.observe(Operation::Exists, self.backend.exists(key))
            .await
            .unwrap_or_else(|err| {
                error!(key = %key, error = %err, "Cache exists error");
                false
            })
    }

    // == Batch ==
    /// Returns one entry per requested key; every key is absent on failure.
    pub async fn mget(&self, keys: &[String]) -> HashMap<String, Option<Value>> {
        match self.observe(Operation::Mget, self.backend.mget(keys)).await {
            Ok(found) => {
                let hits = found.values().filter(|v| v.is_some()).count() as u64;
                let mut metrics = self.metrics.lock();
                for _ in 0..hits {
                    metrics.record_hit();
                }
                for _ in hits..found.len() as u64 {
                    metrics.record_miss();
                }
                found
            }
            Err(err) => {
                error!(count = keys.len(), error = %err, "Cache mget error");
                keys.iter().map(|k| (k.clone(), None)).collect()
            }
        }
    }

    pub async fn mset(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
        tags: HashMap<String, Vec<String>>,
    ) -> bool {
        let count = items.len();
        match self
            .observe(Operation::Mset, self.backend.mset(items, ttl, tags))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(count, "Cache mset partially failed");
                false
            }
            Err(err) => {
                error!(count, error = %err, "Cache mset error");
                false
            }
        }
    }

    // == Keys / Clear ==
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.observe(Operation::Keys, self.backend.keys(pattern))
            .await
            .unwrap_or_else(|err| {
                error!(pattern = %pattern, error = %err, "Cache keys error");
                Vec::new()
            })
    }

    pub async fn clear(&self, pattern: &str) -> usize {
        match self.observe(Operation::Clear, self.backend.clear(pattern)).await {
            Ok(count) => {
                info!(pattern = %pattern, count, "Cache cleared");
                count
            }
            Err(err) => {
                error!(pattern = %pattern, error = %err, "Cache clear error");
                0
            }
        }
    }

    // == Tag Invalidation ==
    /// Removes every item tagged with any of `tags`.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        match self
            .observe(Operation::Invalidate, self.backend.invalidate_tags(tags))
            .await
        {
            Ok(count) => {
                info!(tags = ?tags, count, "Cache invalidated by tags");
                count
            }
            Err(err) => {
                error!(tags = ?tags, error = %err, "Invalidate by tags error");
                0
            }
        }
    }

    // == Get With Fallback ==
    /// Returns the cached value or computes, stores and returns it.
    ///
    /// A computed `None` or JSON `null` is returned but not stored. Compute
    /// errors propagate uncached.
    pub async fn get_with_fallback<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> std::result::Result<Option<Value>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<Value>, E>>,
        E: std::fmt::Display,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(Some(cached));
        }

        let computed = compute().await.map_err(|err| {
            error!(key = %key, error = %err, "Fallback compute failed");
            err
        })?;

        if let Some(value) = computed.as_ref().filter(|v| !v.is_null()) {
            self.set(key, value.clone(), ttl, tags).await;
        }
        Ok(computed)
    }

    // == Maintenance ==
    pub async fn purge_expired(&self) -> Result<usize> {
        self.backend.purge_expired().await
    }

    pub async fn evict_to_target(&self) -> Result<usize> {
        self.backend.evict_to_target().await
    }

    pub async fn backend_stats(&self) -> Result<BackendStats> {
        self.backend.stats().await
    }

    // == Stats ==
    pub async fn stats(&self) -> ManagerStats {
        let (backend, backend_error) = match self.backend.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(err) => {
                error!(error = %err, "Get stats error");
                (None, Some(err.to_string()))
            }
        };

        ManagerStats {
            backend,
            backend_error,
            metrics: self.metrics.lock().snapshot(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Shuts the backend down. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.detach_ownership();
        match self.backend.shutdown().await {
            Ok(()) => info!("Cache manager shutdown complete"),
            Err(err) => error!(error = %err, "Cache backend shutdown failed"),
        }
    }
}
