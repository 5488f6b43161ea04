//! Document Backend
//!
//! Persistent backend storing one SQLite row per cache entry, keyed by a
//! unique index on `key`. Expiry is enforced through an index on
//! `expires_at`: reads filter on it and a background sweeper deletes rows
//! whose time has passed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::cache::backend::{BackendKind, BackendStats, CacheBackend};
use crate::cache::item::current_timestamp_ms;
use crate::cache::pattern::KeyPattern;
use crate::error::{CacheError, Result};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS cache_items (
    key          TEXT PRIMARY KEY,
    value        TEXT NOT NULL,
    tags         TEXT NOT NULL DEFAULT '[]',
    created_at   INTEGER NOT NULL,
    accessed_at  INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    expires_at   INTEGER
);

CREATE INDEX IF NOT EXISTS idx_cache_items_expires_at ON cache_items(expires_at);
"#;

const UPSERT: &str = "INSERT OR REPLACE INTO cache_items \
     (key, value, tags, created_at, accessed_at, access_count, expires_at) \
     VALUES (?1, ?2, ?3, ?4, ?4, 0, ?5)";

const SELECT_LIVE: &str =
    "SELECT value FROM cache_items WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)";

const TOUCH: &str =
    "UPDATE cache_items SET accessed_at = ?2, access_count = access_count + 1 WHERE key = ?1";

/// A row ready to be written.
struct DocumentRow {
    key: String,
    value: String,
    tags: String,
    expires_at: Option<i64>,
}

// == Document Backend ==
/// SQLite-backed document store.
pub struct DocumentBackend {
    conn: Connection,
    max_item_size: usize,
    expired: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentBackend {
    /// Opens (or creates) the store and starts the expiry sweeper.
    ///
    /// # Arguments
    /// * `path` - Database file, or `:memory:`
    /// * `max_item_size` - Largest single document accepted, in bytes
    /// * `sweep_interval` - Time between expiry sweeps
    pub async fn open(path: &str, max_item_size: usize, sweep_interval: Duration) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };

        conn.call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
            .await?;

        let expired = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(conn.clone(), sweep_interval, expired.clone(), shutdown_rx);

        info!(path = %path, "Document backend opened");
        Ok(Self {
            conn,
            max_item_size,
            expired,
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(CacheError::BackendUnavailable("document backend is shut down".into()));
        }
        Ok(())
    }

    fn build_row(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<DocumentRow> {
        let value = serde_json::to_string(value)?;
        let tags = serde_json::to_string(tags)?;
        let size = key.len() + value.len() + tags.len();
        if size > self.max_item_size {
            return Err(CacheError::ItemTooLarge {
                key: key.to_string(),
                size,
                max: self.max_item_size,
            });
        }

        let now = current_timestamp_ms();
        Ok(DocumentRow {
            key: key.to_string(),
            value,
            tags,
            expires_at: ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64) as i64),
        })
    }

    async fn write_rows(&self, rows: Vec<DocumentRow>) -> Result<()> {
        self.ensure_open()?;
        let now = current_timestamp_ms() as i64;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT)?;
                    for row in &rows {
                        stmt.execute(params![row.key, row.value, row.tags, now, row.expires_at])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Reads live rows and records the access, in one transaction.
    async fn read_rows(&self, keys: Vec<String>) -> Result<Vec<(String, Option<String>)>> {
        self.ensure_open()?;
        let now = current_timestamp_ms() as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut found = Vec::with_capacity(keys.len());
                {
                    let mut select = tx.prepare_cached(SELECT_LIVE)?;
                    let mut touch = tx.prepare_cached(TOUCH)?;
                    for key in keys {
                        let value: Option<String> = select
                            .query_row(params![key, now], |row| row.get(0))
                            .optional()?;
                        if value.is_some() {
                            touch.execute(params![key, now])?;
                        }
                        found.push((key, value));
                    }
                }
                tx.commit()?;
                Ok(found)
            })
            .await?;
        Ok(rows)
    }
}

fn decode_document(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key = %key, error = %err, "Undecodable document");
            None
        }
    }
}

async fn delete_expired(conn: &Connection) -> Result<usize> {
    let now = current_timestamp_ms() as i64;
    let removed = conn
        .call(move |conn| {
            conn.execute(
                "DELETE FROM cache_items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(|e| e.into())
        })
        .await?;
    Ok(removed)
}

fn spawn_sweeper(
    conn: Connection,
    interval: Duration,
    expired: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match delete_expired(&conn).await {
                        Ok(0) => {}
                        Ok(count) => {
                            expired.fetch_add(count as u64, Ordering::Relaxed);
                            debug!(count, "Expiry sweep removed documents");
                        }
                        Err(err) => warn!(error = %err, "Expiry sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("Expiry sweeper stopped");
    })
}

#[async_trait]
impl CacheBackend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut rows = self.read_rows(vec![key.to_string()]).await?;
        Ok(rows
            .pop()
            .and_then(|(key, raw)| raw.and_then(|raw| decode_document(&key, &raw))))
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<()> {
        let row = self.build_row(key, &value, ttl, &tags)?;
        self.write_rows(vec![row]).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let key = key.to_string();
        let now = current_timestamp_ms() as i64;
        let removed = self
            .conn
            .call(move |conn| {
                let live = conn.execute(
                    "DELETE FROM cache_items WHERE key = ?1 \
                     AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                )?;
                conn.execute("DELETE FROM cache_items WHERE key = ?1", params![key])?;
                Ok(live)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let key = key.to_string();
        let now = current_timestamp_ms() as i64;
        let found = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT 1 FROM cache_items WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |_| Ok(()),
                )
                .optional()
                .map_err(|e| e.into())
            })
            .await?;
        Ok(found.is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let rows = self.read_rows(keys.to_vec()).await?;
        Ok(rows
            .into_iter()
            .map(|(key, raw)| {
                let value = raw.and_then(|raw| decode_document(&key, &raw));
                (key, value)
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
        let mut rows = Vec::with_capacity(items.len());

        for (key, value) in &items {
            let item_tags = tags.get(key).map(Vec::as_slice).unwrap_or(&[]);
            match self.build_row(key, value, ttl, item_tags) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping item in batch write");
                    all_written = false;
                }
            }
        }

        if !rows.is_empty() {
            self.write_rows(rows).await?;
        }
        Ok(all_written)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let glob = KeyPattern::new(pattern)?.to_sqlite_glob();
        let now = current_timestamp_ms() as i64;
        let keys = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT key FROM cache_items WHERE key GLOB ?1 \
                     AND (expires_at IS NULL OR expires_at > ?2) ORDER BY key",
                )?;
                let keys = stmt
                    .query_map(params![glob, now], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await?;
        Ok(keys)
    }

    async fn clear(&self, pattern: &str) -> Result<usize> {
        self.ensure_open()?;
        let glob = KeyPattern::new(pattern)?.to_sqlite_glob();
        let now = current_timestamp_ms() as i64;
        let removed = self
            .conn
            .call(move |conn| {
                let live = conn.execute(
                    "DELETE FROM cache_items WHERE key GLOB ?1 \
                     AND (expires_at IS NULL OR expires_at > ?2)",
                    params![glob, now],
                )?;
                conn.execute("DELETE FROM cache_items WHERE key GLOB ?1", params![glob])?;
                Ok(live)
            })
            .await?;
        Ok(removed)
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
        self.ensure_open()?;
        if tags.is_empty() {
            return Ok(0);
        }
        let wanted = serde_json::to_string(tags)?;
        let now = current_timestamp_ms() as i64;
        let removed = self
            .conn
            .call(move |conn| {
                let live = conn.execute(
                    "DELETE FROM cache_items WHERE (expires_at IS NULL OR expires_at > ?2) \
                     AND EXISTS ( \
                         SELECT 1 FROM json_each(cache_items.tags) AS t \
                         WHERE t.value IN (SELECT value FROM json_each(?1)))",
                    params![wanted, now],
                )?;
                conn.execute(
                    "DELETE FROM cache_items WHERE EXISTS ( \
                         SELECT 1 FROM json_each(cache_items.tags) AS t \
                         WHERE t.value IN (SELECT value FROM json_each(?1)))",
                    params![wanted],
                )?;
                Ok(live)
            })
            .await?;
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        let removed = delete_expired(&self.conn).await?;
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<BackendStats> {
        self.ensure_open()?;
        let (count, bytes, file_bytes) = self
            .conn
            .call(|conn| {
                let (count, bytes): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(key) + LENGTH(value) + LENGTH(tags)), 0) \
                     FROM cache_items",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
                let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
                Ok((count, bytes, page_count * page_size))
            })
            .await?;

        let mut stats = BackendStats::new(BackendKind::Document);
        stats.item_count = count.max(0) as u64;
        stats.memory_bytes = bytes.max(0) as u64;
        stats.expired = self.expired.load(Ordering::Relaxed);
        stats
            .details
            .insert("file_bytes".into(), Value::from(file_bytes.max(0)));
        Ok(stats)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                warn!(error = %err, "Expiry sweeper did not stop cleanly");
            }
            info!("Document backend closed");
        }
        Ok(())
    }
}
