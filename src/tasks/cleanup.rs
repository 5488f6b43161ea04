//! Cleanup Scheduler
//!
//! Background loop that keeps the cache tidy. Each cycle:
//! 1. purges expired items when the backend has no native TTL
//! 2. evicts down to the target size when usage is above 90%
//! 3. clears the well-known ephemeral key patterns
//! 4. collects backend stats for the cycle report
//!
//! A failed cycle is logged and the next one runs after the retry delay
//! instead of the normal interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{BackendStats, CacheManager};
use crate::error::Result;

/// Usage percentage above which a cycle triggers eviction.
pub const EVICTION_TRIGGER_PERCENT: f64 = 90.0;

/// Key patterns cleared on every cycle regardless of their TTL.
pub const EPHEMERAL_PATTERNS: [&str; 4] = ["temp:*", "session:*", "lock:*", "rate_limit:*"];

/// Counters exposed through `/stats` and `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub cleanups_performed: u64,
    pub total_keys_cleared: u64,
    pub errors: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// What one cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub started_at: DateTime<Utc>,
    pub expired_purged: usize,
    pub evicted: usize,
    pub ephemeral_cleared: BTreeMap<String, usize>,
    pub keys_cleared: usize,
    pub duration_ms: u64,
    pub backend: BackendStats,
}

pub struct CleanupScheduler {
    cache: Arc<CacheManager>,
    interval: Duration,
    retry_delay: Duration,
    stats: Mutex<SchedulerStats>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    pub fn new(cache: Arc<CacheManager>, interval: Duration, retry_delay: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cache,
            interval,
            retry_delay,
            stats: Mutex::new(SchedulerStats::default()),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.stats.lock().running
    }

    /// Spawns the cleanup loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.stats.lock().running = true;

        *task = Some(tokio::spawn(async move {
            info!(
                interval_secs = scheduler.interval.as_secs(),
                "Cleanup scheduler started"
            );

            let mut delay = scheduler.interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }

                delay = match scheduler.run_cycle().await {
                    Ok(_) => scheduler.interval,
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_in_secs = scheduler.retry_delay.as_secs(),
                            "Cleanup cycle failed"
                        );
                        scheduler.retry_delay
                    }
                };
            }

            scheduler.stats.lock().running = false;
            info!("Cleanup scheduler stopped");
        }));
    }

    /// Signals the loop and waits for it to exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Cleanup task ended abnormally");
            }
        }
        self.stats.lock().running = false;
    }

    /// Runs one maintenance cycle now and records its outcome.
    pub async fn run_cycle(&self) -> Result<CleanupReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        match self.cycle(started_at, start).await {
            Ok(report) => {
                let mut stats = self.stats.lock();
                stats.cleanups_performed += 1;
                stats.total_keys_cleared += report.keys_cleared as u64;
                stats.last_cleanup = Some(started_at);
                stats.last_duration_ms = Some(report.duration_ms);
                stats.last_error = None;
                drop(stats);

                if report.keys_cleared > 0 {
                    info!(
                        expired = report.expired_purged,
                        evicted = report.evicted,
                        keys_cleared = report.keys_cleared,
                        duration_ms = report.duration_ms,
                        "Cleanup cycle complete"
                    );
                } else {
                    debug!(duration_ms = report.duration_ms, "Cleanup cycle: nothing to do");
                }
                Ok(report)
            }
            Err(e) => {
                let mut stats = self.stats.lock();
                stats.errors += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn cycle(&self, started_at: DateTime<Utc>, start: Instant) -> Result<CleanupReport> {
        let expired_purged = if self.cache.has_native_ttl() {
            0
        } else {
            self.cache.purge_expired().await?
        };

        let usage = self.cache.backend_stats().await?.usage_percent;
        let evicted = match usage {
            Some(percent) if percent > EVICTION_TRIGGER_PERCENT => {
                info!(usage_percent = percent, "Cache above eviction threshold");
                self.cache.evict_to_target().await?
            }
            _ => 0,
        };

        let mut ephemeral_cleared = BTreeMap::new();
        for pattern in EPHEMERAL_PATTERNS {
            let cleared = self.cache.clear(pattern).await;
            ephemeral_cleared.insert(pattern.to_string(), cleared);
        }

        let backend = self.cache.backend_stats().await?;
        let keys_cleared = expired_purged + evicted + ephemeral_cleared.values().sum::<usize>();

        Ok(CleanupReport {
            started_at,
            expired_purged,
            evicted,
            ephemeral_cleared,
            keys_cleared,
            duration_ms: start.elapsed().as_millis() as u64,
            backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BackendKind, CacheBackend, EvictionPolicy, MemoryBackend};
    use crate::error::CacheError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory backend whose maintenance calls fail while `failing` is set.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::BackendUnavailable("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: Value,
            ttl: Option<Duration>,
            tags: Vec<String>,
        ) -> Result<()> {
            self.inner.set(key, value, ttl, tags).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
            self.inner.mget(keys).await
        }

        async fn mset(
            &self,
            items: HashMap<String, Value>,
            ttl: Option<Duration>,
            tags: HashMap<String, Vec<String>>,
        ) -> Result<bool> {
            self.inner.mset(items, ttl, tags).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.keys(pattern).await
        }

        async fn clear(&self, pattern: &str) -> Result<usize> {
            self.inner.clear(pattern).await
        }

        async fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
            self.inner.invalidate_tags(tags).await
        }

        async fn purge_expired(&self) -> Result<usize> {
            self.check()?;
            self.inner.purge_expired().await
        }

        async fn stats(&self) -> Result<BackendStats> {
            self.check()?;
            self.inner.stats().await
        }

        async fn shutdown(&self) -> Result<()> {
            self.inner.shutdown().await
        }
    }

    fn scheduler_with(max_size: usize) -> (Arc<CacheManager>, Arc<CleanupScheduler>) {
        let backend = MemoryBackend::new(max_size, max_size, EvictionPolicy::Lru, None);
        let cache = Arc::new(CacheManager::new(Arc::new(backend)));
        let scheduler = CleanupScheduler::new(
            cache.clone(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        (cache, scheduler)
    }

    #[tokio::test]
    async fn test_cycle_clears_ephemeral_patterns() {
        let (cache, scheduler) = scheduler_with(1024 * 1024);
        for key in ["temp:a", "session:b", "lock:c", "rate_limit:d", "tech:python"] {
            assert!(cache.set(key, json!(1), None, vec![]).await);
        }

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.ephemeral_cleared["temp:*"], 1);
        assert_eq!(report.keys_cleared, 4);
        assert!(cache.exists("tech:python").await);
        assert!(!cache.exists("session:b").await);
    }

    #[tokio::test]
    async fn test_cycle_purges_expired() {
        let (cache, scheduler) = scheduler_with(1024 * 1024);
        cache
            .set("short", json!("v"), Some(Duration::from_millis(10)), vec![])
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.expired_purged, 1);
        assert_eq!(report.backend.item_count, 0);
    }

    #[tokio::test]
    async fn test_cycle_evicts_above_threshold() {
        let (cache, scheduler) = scheduler_with(1000);
        // 4 x 234 bytes = 93.6% of the budget
        for i in 0..4 {
            let key = format!("k{}", i);
            assert!(cache.set(&key, json!("x".repeat(230)), None, vec![]).await);
        }

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(report.backend.memory_bytes <= 800);
    }

    #[tokio::test]
    async fn test_stats_track_cycles() {
        let (_, scheduler) = scheduler_with(1024 * 1024);
        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.cleanups_performed, 2);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_cleanup.is_some());
    }

    #[tokio::test]
    async fn test_loop_runs_and_stops_promptly() {
        let (cache, scheduler) = scheduler_with(1024 * 1024);
        cache.set("temp:x", json!(1), None, vec![]).await;

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!cache.exists("temp:x").await);

        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("scheduler should stop within one iteration");
        assert!(!scheduler.is_running());
        assert!(scheduler.stats().cleanups_performed >= 1);
    }

    #[tokio::test]
    async fn test_failed_cycles_retry_sooner_and_keep_running() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(1024 * 1024, 1024 * 1024, EvictionPolicy::Lru, None),
            failing: AtomicBool::new(true),
        });
        let cache = Arc::new(CacheManager::new(backend.clone()));
        let scheduler = CleanupScheduler::new(
            cache.clone(),
            Duration::from_millis(100),
            Duration::from_millis(5),
        );

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // At the normal interval only two cycles fit in this window.
        let stats = scheduler.stats();
        assert!(stats.running);
        assert!(stats.errors >= 5, "errors = {}", stats.errors);
        assert_eq!(stats.cleanups_performed, 0);
        assert!(stats.last_error.as_deref().unwrap().contains("disk full"));

        backend.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let stats = scheduler.stats();
        assert!(stats.running);
        assert!(stats.cleanups_performed >= 1);
        assert!(stats.last_error.is_none());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
