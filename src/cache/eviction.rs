//! Eviction Engine
//!
//! Chooses which entries leave the memory backend when it is over budget.
//! Expired entries always go first; the configured policy orders the rest.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Eviction drains the backend down to this share of its byte budget.
pub const EVICTION_TARGET_RATIO: f64 = 0.8;

// == Eviction Policy ==
/// Ordering applied to live entries once expired ones are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least Recently Used
    #[default]
    Lru,
    /// Least Frequently Used
    Lfu,
    /// First In, First Out
    Fifo,
    /// Uniformly shuffled
    Random,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            "random" => Ok(EvictionPolicy::Random),
            _ => Err(format!("Unknown eviction policy: {}", s)),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
            EvictionPolicy::Random => write!(f, "random"),
        }
    }
}

// == Candidate ==
/// Snapshot of the fields eviction ordering looks at.
///
/// Wall-clock timestamps have millisecond resolution, so `access_seq` and
/// `insert_seq` (monotonic per backend) break ties between entries touched
/// or written within the same millisecond.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    pub size: usize,
    pub expired: bool,
    pub accessed_at: u64,
    pub access_count: u64,
    pub created_at: u64,
    pub access_seq: u64,
    pub insert_seq: u64,
}

/// Byte level eviction should drain to for a given budget.
pub fn target_size(max_size: usize) -> usize {
    (max_size as f64 * EVICTION_TARGET_RATIO) as usize
}

// == Planning ==
/// Returns keys to remove, in eviction order, until at least `bytes_to_free`
/// bytes are released or candidates run out.
///
/// Every expired candidate is included even if the target is met earlier,
/// since expired entries are dead weight regardless of budget.
pub fn plan(policy: EvictionPolicy, candidates: Vec<Candidate>, bytes_to_free: usize) -> Vec<String> {
    let (expired, mut live): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.expired);

    let mut freed = 0usize;
    let mut victims = Vec::with_capacity(expired.len());
    for candidate in expired {
        freed = freed.saturating_add(candidate.size);
        victims.push(candidate.key);
    }

    if freed >= bytes_to_free {
        return victims;
    }

    order(policy, &mut live);
    for candidate in live {
        if freed >= bytes_to_free {
            break;
        }
        freed = freed.saturating_add(candidate.size);
        victims.push(candidate.key);
    }

    victims
}

fn order(policy: EvictionPolicy, candidates: &mut [Candidate]) {
    match policy {
        EvictionPolicy::Lru => candidates.sort_by(|a, b| {
            (a.accessed_at, a.access_seq).cmp(&(b.accessed_at, b.access_seq))
        }),
        EvictionPolicy::Lfu => candidates.sort_by(|a, b| match a.access_count.cmp(&b.access_count) {
            Ordering::Equal => a.access_seq.cmp(&b.access_seq),
            other => other,
        }),
        EvictionPolicy::Fifo => candidates.sort_by(|a, b| {
            (a.created_at, a.insert_seq).cmp(&(b.created_at, b.insert_seq))
        }),
        EvictionPolicy::Random => candidates.shuffle(&mut rand::thread_rng()),
    }
}
