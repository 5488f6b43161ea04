//! Cache Metrics Module
//!
//! Tracks façade operation counts, hits and misses, per-operation errors and
//! a bounded window of recent latencies.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Latency samples kept per operation.
pub const LATENCY_WINDOW: usize = 1000;

// == Operation ==
/// Façade operations with their own counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Get,
    Set,
    Delete,
    Exists,
    Mget,
    Mset,
    Keys,
    Clear,
    Invalidate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
            Operation::Mget => "mget",
            Operation::Mset => "mset",
            Operation::Keys => "keys",
            Operation::Clear => "clear",
            Operation::Invalidate => "invalidate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    latencies: VecDeque<Duration>,
}

impl OperationStats {
    fn average_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let total: Duration = self.latencies.iter().sum();
        total.as_secs_f64() * 1000.0 / self.latencies.len() as f64
    }
}

// == Cache Metrics ==
/// Mutable metrics state. Wrap in a lock to share.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    operations: BTreeMap<Operation, OperationStats>,
    hits: u64,
    misses: u64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed call and its latency.
    pub fn record(&mut self, op: Operation, elapsed: Duration) {
        let stats = self.operations.entry(op).or_default();
        stats.count += 1;
        if stats.latencies.len() == LATENCY_WINDOW {
            stats.latencies.pop_front();
        }
        stats.latencies.push_back(elapsed);
    }

    /// Records a failed call. Failed calls still count as calls.
    pub fn record_error(&mut self, op: Operation) {
        let stats = self.operations.entry(op).or_default();
        stats.count += 1;
        stats.errors += 1;
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn count(&self, op: Operation) -> u64 {
        self.operations.get(&op).map_or(0, |s| s.count)
    }

    pub fn errors(&self, op: Operation) -> u64 {
        self.operations.get(&op).map_or(0, |s| s.errors)
    }

    /// Samples currently held for `op`.
    pub fn window_len(&self, op: Operation) -> usize {
        self.operations.get(&op).map_or(0, |s| s.latencies.len())
    }

    // == Hit Rate ==
    /// Hits as a percentage of lookups, or 0.0 with no lookups.
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut operations = BTreeMap::new();
        let mut errors = BTreeMap::new();
        let mut avg_latency_ms = BTreeMap::new();
        for (op, stats) in &self.operations {
            operations.insert(op.as_str(), stats.count);
            errors.insert(op.as_str(), stats.errors);
            avg_latency_ms.insert(op.as_str(), stats.average_ms());
        }

        MetricsSnapshot {
            operations,
            hits: self.hits,
            misses: self.misses,
            hit_rate_percent: self.hit_rate_percent(),
            errors,
            avg_latency_ms,
        }
    }
}

/// Serializable view of [`CacheMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<&'static str, u64>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub errors: BTreeMap<&'static str, u64>,
    pub avg_latency_ms: BTreeMap<&'static str, f64>,
}
