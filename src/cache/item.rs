//! Cache Item Module
//!
//! Defines the value container stored by every backend, with expiry and
//! access metadata.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::codec;

/// Size charged for a value whose encoded length cannot be measured.
const FALLBACK_ITEM_SIZE: usize = 1024;

// == Cache Item ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    /// Unique key within the backend namespace
    pub key: String,
    /// Opaque payload
    pub value: Value,
    /// Time to live, None = never expires by time
    #[serde(with = "ttl_millis")]
    pub ttl: Option<Duration>,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Last successful read (Unix milliseconds)
    pub accessed_at: u64,
    /// Number of successful reads
    pub access_count: u64,
    /// Group invalidation labels
    pub tags: BTreeSet<String>,
    /// Side-channel data, not interpreted by the cache core
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CacheItem {
    // == Constructor ==
    /// Creates a new item stamped with the current time.
    pub fn new(
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            key: key.into(),
            value,
            ttl,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            tags: tags.into_iter().collect(),
            metadata: Map::new(),
        }
    }

    // == Expiry ==
    /// Absolute expiry time in Unix milliseconds, if the item has a TTL.
    pub fn expires_at(&self) -> Option<u64> {
        self.ttl
            .map(|ttl| self.created_at.saturating_add(ttl.as_millis() as u64))
    }

    /// Checks if the item has expired.
    ///
    /// An item is expired once `now >= created_at + ttl`, so it disappears
    /// the instant its TTL has fully elapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at() {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    /// Returns remaining TTL, or None if no expiration is set.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at().map(|expires| {
            let now = current_timestamp_ms();
            Duration::from_millis(expires.saturating_sub(now))
        })
    }

    // == Access Tracking ==
    /// Records a successful read.
    pub fn touch(&mut self) {
        self.accessed_at = current_timestamp_ms().max(self.created_at);
        self.access_count += 1;
    }

    /// Returns true if any of `tags` is attached to this item.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }

    // == Size Estimate ==
    /// Estimated footprint in bytes: key plus encoded value plus tags.
    pub fn estimated_size(&self) -> usize {
        let value_size = codec::encoded_len(&self.value).unwrap_or(FALLBACK_ITEM_SIZE);
        let tag_size: usize = self.tags.iter().map(String::len).sum();
        self.key.len() + value_size + tag_size
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ttl.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
