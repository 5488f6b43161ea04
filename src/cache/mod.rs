//! Cache Module
//!
//! Backend-agnostic cache tier: the storage contract, three engines, the
//! eviction engine used by the memory engine, and the manager façade.

mod backend;
mod codec;
mod document;
mod eviction;
mod item;
mod manager;
mod memory;
mod metrics;
mod pattern;
mod redis;


// Re-export public types
pub use backend::{open_backend, BackendKind, BackendStats, CacheBackend};
pub use document::DocumentBackend;
pub use eviction::{EvictionPolicy, EVICTION_TARGET_RATIO};
pub use item::{current_timestamp_ms, CacheItem};
pub use manager::{CacheManager, KeyOwnership, ManagerStats};
pub use memory::MemoryBackend;
pub use metrics::{CacheMetrics, MetricsSnapshot, Operation};
pub use pattern::{KeyPattern, MATCH_ALL};
pub use self::redis::RedisBackend;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Largest `keys` listing returned in one call
pub const MAX_KEYS_LIMIT: usize = 10_000;

/// Largest batch accepted by `mget`/`mset`
pub const MAX_BATCH_SIZE: usize = 1000;
