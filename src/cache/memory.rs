//! Memory Backend
//!
//! In-process map bounded by a byte budget. The item map, the size counter
//! and eviction all live behind one mutex so an eviction pass never
//! interleaves with an insert, a delete or another eviction pass.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::cache::backend::{BackendKind, BackendStats, CacheBackend};
use crate::cache::eviction::{self, Candidate, EvictionPolicy};
use crate::cache::item::{current_timestamp_ms, CacheItem};
use crate::cache::pattern::KeyPattern;
use crate::error::{CacheError, Result};

// == Slot ==
#[derive(Debug)]
struct Slot {
    item: CacheItem,
    size: usize,
    insert_seq: u64,
    access_seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<String, Slot>,
    current_size: usize,
    seq: u64,
    evictions: u64,
    expired: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.items.remove(key)?;
        self.current_size = self.current_size.saturating_sub(slot.size);
        Some(slot)
    }

    fn insert(&mut self, item: CacheItem, size: usize) {
        let seq = self.next_seq();
        let key = item.key.clone();
        self.remove(&key);
        self.current_size += size;
        self.items.insert(
            key,
            Slot {
                item,
                size,
                insert_seq: seq,
                access_seq: seq,
            },
        );
    }

    /// Looks up a live item, dropping it if it has expired.
    fn live_mut(&mut self, key: &str, now: u64) -> Option<&mut Slot> {
        let expired = self.items.get(key)?.item.is_expired_at(now);
        if expired {
            self.remove(key);
            self.expired += 1;
            return None;
        }
        self.items.get_mut(key)
    }

    fn read(&mut self, key: &str, now: u64) -> Option<Value> {
        let seq = self.next_seq();
        let slot = self.live_mut(key, now)?;
        slot.item.touch();
        slot.access_seq = seq;
        Some(slot.item.value.clone())
    }

    fn candidates(&self, exclude: Option<&str>, now: u64) -> Vec<Candidate> {
        self.items
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != exclude)
            .map(|(key, slot)| Candidate {
                key: key.clone(),
                size: slot.size,
                expired: slot.item.is_expired_at(now),
                accessed_at: slot.item.accessed_at,
                access_count: slot.item.access_count,
                created_at: slot.item.created_at,
                access_seq: slot.access_seq,
                insert_seq: slot.insert_seq,
            })
            .collect()
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &CacheItem) -> bool,
    {
        let doomed: Vec<String> = self
            .items
            .iter()
            .filter(|(key, slot)| predicate(key, &slot.item))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Removes every matching item but only counts the live ones. Expired
    /// matches go to the `expired` counter instead.
    fn remove_live_where<F>(&mut self, now: u64, mut predicate: F) -> usize
    where
        F: FnMut(&str, &CacheItem) -> bool,
    {
        let mut expired = 0;
        let removed = self.remove_where(|key, item| {
            let matched = predicate(key, item);
            if matched && item.is_expired_at(now) {
                expired += 1;
            }
            matched
        });
        self.expired += expired as u64;
        removed - expired
    }
}

// == Memory Backend ==
/// Size-bounded in-memory backend with pluggable eviction.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    policy: EvictionPolicy,
    /// Byte budget
    max_size: usize,
    /// Largest single item accepted
    max_item_size: usize,
    /// Applied when `set` is called without a TTL
    default_ttl: Option<Duration>,
}

impl MemoryBackend {
    // == Constructor ==
    /// Creates an empty backend.
    ///
    /// # Arguments
    /// * `max_size` - Byte budget for all items together
    /// * `max_item_size` - Largest single item accepted, in bytes
    /// * `policy` - Ordering used when the budget is exceeded
    /// * `default_ttl` - TTL for items set without one (`None` = no expiry)
    pub fn new(
        max_size: usize,
        max_item_size: usize,
        policy: EvictionPolicy,
        default_ttl: Option<Duration>,
    ) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            policy,
            max_size,
            max_item_size,
            default_ttl,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Bytes currently accounted to stored items.
    pub fn current_size(&self) -> usize {
        self.state.lock().current_size
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build_item(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<(CacheItem, usize)> {
        let item = CacheItem::new(key, value, ttl.or(self.default_ttl), tags);
        let size = item.estimated_size();
        if size > self.max_item_size {
            return Err(CacheError::ItemTooLarge {
                key: key.to_string(),
                size,
                max: self.max_item_size,
            });
        }
        Ok((item, size))
    }

    /// Inserts under the lock, evicting other entries first if the write
    /// would push the backend over budget.
    fn store_locked(&self, state: &mut MemoryState, item: CacheItem, size: usize) {
        let replaced = state.items.get(&item.key).map_or(0, |slot| slot.size);
        let projected = state.current_size - replaced + size;

        if projected > self.max_size {
            let target = eviction::target_size(self.max_size);
            let to_free = projected.saturating_sub(target);
            self.evict_locked(state, to_free, Some(&item.key));
        }

        state.insert(item, size);
    }

    fn evict_locked(&self, state: &mut MemoryState, to_free: usize, exclude: Option<&str>) -> usize {
        let now = current_timestamp_ms();
        let victims = eviction::plan(self.policy, state.candidates(exclude, now), to_free);

        let mut evicted = 0;
        for key in &victims {
            if let Some(slot) = state.remove(key) {
                if slot.item.is_expired_at(now) {
                    state.expired += 1;
                } else {
                    state.evictions += 1;
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                evicted,
                policy = %self.policy,
                current_size = state.current_size,
                "Memory backend eviction pass"
            );
        }
        evicted
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = current_timestamp_ms();
        Ok(self.state.lock().read(key, now))
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<()> {
        let (item, size) = self.build_item(key, value, ttl, tags)?;
        let mut state = self.state.lock();
        self.store_locked(&mut state, item, size);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = current_timestamp_ms();
        let mut state = self.state.lock();
        if state.live_mut(key, now).is_none() {
            return Ok(false);
        }
        Ok(state.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = current_timestamp_ms();
        Ok(self.state.lock().live_mut(key, now).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let now = current_timestamp_ms();
        let mut state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| (key.clone(), state.read(key, now)))
            .collect())
    }

    async fn mset(
        &self,
        items: HashMap<String, Value>,
        ttl: Option<Duration>,
        mut tags: HashMap<String, Vec<String>>,
    ) -> Result<bool> {
        let mut all_written = true;
        for (key, value) in items {
            let item_tags = tags.remove(&key).unwrap_or_default();
            match self.build_item(&key, value, ttl, item_tags) {
                Ok((item, size)) => {
                    let mut state = self.state.lock();
                    self.store_locked(&mut state, item, size);
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "Skipping item in batch write");
                    all_written = false;
                }
            }
        }
        Ok(all_written)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = KeyPattern::new(pattern)?;
        let now = current_timestamp_ms();
        let state = self.state.lock();
        Ok(state
            .items
            .iter()
            .filter(|(key, slot)| !slot.item.is_expired_at(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn clear(&self, pattern: &str) -> Result<usize> {
        let pattern = KeyPattern::new(pattern)?;
        let now = current_timestamp_ms();
        let mut state = self.state.lock();
        Ok(state.remove_live_where(now, |key, _| pattern.matches(key)))
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<usize> {
        let now = current_timestamp_ms();
        let mut state = self.state.lock();
        Ok(state.remove_live_where(now, |_, item| item.has_any_tag(tags)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = current_timestamp_ms();
        let mut state = self.state.lock();
        let purged = state.remove_where(|_, item| item.is_expired_at(now));
        state.expired += purged as u64;
        Ok(purged)
    }

    async fn evict_to_target(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let target = eviction::target_size(self.max_size);
        if state.current_size <= target {
            return Ok(0);
        }
        let to_free = state.current_size - target;
        Ok(self.evict_locked(&mut state, to_free, None))
    }

    async fn stats(&self) -> Result<BackendStats> {
        let state = self.state.lock();
        let mut stats = BackendStats::new(BackendKind::Memory);
        stats.item_count = state.items.len() as u64;
        stats.memory_bytes = state.current_size as u64;
        stats.max_bytes = Some(self.max_size as u64);
        stats.usage_percent = Some(if self.max_size == 0 {
            0.0
        } else {
            state.current_size as f64 / self.max_size as f64 * 100.0
        });
        stats.evictions = state.evictions;
        stats.expired = state.expired;
        stats.details.insert("policy".into(), Value::from(self.policy.to_string()));
        stats
            .details
            .insert("max_item_bytes".into(), Value::from(self.max_item_size as u64));
        stats.details.insert(
            "default_ttl_seconds".into(),
            self.default_ttl
                .map_or(Value::Null, |ttl| Value::from(ttl.as_secs())),
        );
        Ok(stats)
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.items.clear();
        state.current_size = 0;
        Ok(())
    }
}
