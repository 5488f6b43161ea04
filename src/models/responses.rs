//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies. The bodies a
//! peer reads back (mget, mset, clear) also derive `Deserialize`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::ManagerStats;
use crate::cluster::{ClusterInfo, NodeShare, ReplicationOutcome};
use crate::models::requests::{ExportFormat, SortField, SortOrder};
use crate::tasks::SchedulerStats;

/// Response body for GET /cache/:key
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested key
    pub key: String,
    /// The stored value
    pub value: Value,
}

impl GetResponse {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Response body for PUT /cache/:key
///
/// # Fields
/// - `message`: Human readable result
/// - `key`: The key that was set
/// - `replication`: Replica acknowledgements, present when clustered
#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    pub message: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationOutcome>,
}

impl SetResponse {
    pub fn new(key: impl Into<String>, replication: Option<ReplicationOutcome>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' set successfully", key),
            key,
            replication,
        }
    }
}

/// Response body for DELETE /cache/:key
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub key: String,
}

impl DeleteResponse {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' deleted successfully", key),
            key,
        }
    }
}

/// Response body for GET /cache/:key/exists
#[derive(Debug, Clone, Serialize)]
pub struct ExistsResponse {
    pub key: String,
    pub exists: bool,
}

/// Response body for POST /cache/mget
///
/// `values` holds exactly one entry per requested key, `null` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgetResponse {
    pub values: HashMap<String, Option<Value>>,
    pub found: usize,
    pub missing: usize,
}

impl MgetResponse {
    pub fn new(values: HashMap<String, Option<Value>>) -> Self {
        let found = values.values().filter(|v| v.is_some()).count();
        let missing = values.len() - found;
        Self {
            values,
            found,
            missing,
        }
    }
}

/// Response body for POST /cache/mset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsetResponse {
    pub success: bool,
    pub stored: usize,
}

/// Response body for GET /cache/keys
#[derive(Debug, Clone, Serialize)]
pub struct KeysResponse {
    pub pattern: String,
    pub keys: Vec<String>,
    pub count: usize,
    /// True when more keys matched than `limit`
    pub truncated: bool,
}

impl KeysResponse {
    pub fn new(pattern: impl Into<String>, mut keys: Vec<String>, limit: usize) -> Self {
        let truncated = keys.len() > limit;
        keys.truncate(limit);
        Self {
            pattern: pattern.into(),
            count: keys.len(),
            keys,
            truncated,
        }
    }
}

/// JSON body for GET /admin/export
#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    pub node_id: String,
    pub format: ExportFormat,
    /// Keys considered, after the limit
    pub total_keys: usize,
    /// Keys that still had a value when read
    pub exported: usize,
    pub data: BTreeMap<String, Value>,
    pub timestamp: String,
}

impl ExportResponse {
    pub fn new(node_id: impl Into<String>, total_keys: usize, data: BTreeMap<String, Value>) -> Self {
        Self {
            node_id: node_id.into(),
            format: ExportFormat::Json,
            total_keys,
            exported: data.len(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One row of GET /admin/monitor/keys
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key: String,
    /// Size of the JSON encoded value
    pub size_bytes: usize,
}

/// Response body for GET /admin/monitor/keys
#[derive(Debug, Clone, Serialize)]
pub struct MonitorKeysResponse {
    pub node_id: String,
    pub keys: Vec<KeyInfo>,
    pub total: usize,
    pub total_size_bytes: usize,
    pub avg_size_bytes: f64,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

impl MonitorKeysResponse {
    /// Sorts every row, then cuts the requested page.
    pub fn paginate(
        node_id: impl Into<String>,
        mut rows: Vec<KeyInfo>,
        sort_by: SortField,
        order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Self {
        match sort_by {
            SortField::Key => rows.sort_by(|a, b| a.key.cmp(&b.key)),
            SortField::Size => {
                rows.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes).then(a.key.cmp(&b.key)))
            }
        }
        if order == SortOrder::Desc {
            rows.reverse();
        }

        let total = rows.len();
        let total_size_bytes: usize = rows.iter().map(|r| r.size_bytes).sum();
        let avg_size_bytes = if total == 0 {
            0.0
        } else {
            total_size_bytes as f64 / total as f64
        };
        let keys: Vec<KeyInfo> = rows.into_iter().skip(offset).take(limit).collect();

        Self {
            node_id: node_id.into(),
            has_more: offset.saturating_add(limit) < total,
            keys,
            total,
            total_size_bytes,
            avg_size_bytes,
            limit,
            offset,
        }
    }
}

/// Response body for DELETE /cache/clear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub pattern: String,
    /// Keys removed on this node
    pub cleared: usize,
    /// Keys removed on peers, 0 on a single node
    #[serde(default)]
    pub peers_cleared: usize,
}

/// Response body for POST /cache/invalidate/tags
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub tags: Vec<String>,
    pub invalidated: usize,
}

/// Response body for POST /cache/replicate
#[derive(Debug, Clone, Serialize)]
pub struct ReplicateResponse {
    pub success: bool,
    pub key: String,
}

/// Result of one health check component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentCheck {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentCheck {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Response body for GET /health
///
/// # Fields
/// - `status`: `healthy`, `degraded` or `unhealthy`
/// - `load`: 0-100 blend of CPU and memory utilization
/// - `checks`: Per-component results (backend, scheduler, cluster)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub version: String,
    pub timestamp: String,
    pub uptime_seconds: f64,
    pub load: f64,
    pub checks: BTreeMap<&'static str, ComponentCheck>,
}

impl HealthResponse {
    /// Derives the overall status: the backend is required, the other
    /// components only degrade the node.
    pub fn from_checks(
        node_id: impl Into<String>,
        version: impl Into<String>,
        uptime_seconds: f64,
        load: f64,
        checks: BTreeMap<&'static str, ComponentCheck>,
    ) -> Self {
        let backend_ok = checks.get("backend").map_or(false, |c| c.healthy);
        let status = if !backend_ok {
            "unhealthy"
        } else if checks.values().all(|c| c.healthy) {
            "healthy"
        } else {
            "degraded"
        };

        Self {
            status: status.to_string(),
            node_id: node_id.into(),
            version: version.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds,
            load,
            checks,
        }
    }
}

/// Response body for GET /health/live and GET /health/ready
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResponse {
    pub status: String,
    pub timestamp: String,
}

impl ProbeResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Response body for GET /stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub node_id: String,
    pub cache: ManagerStats,
    pub scheduler: SchedulerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
}

/// Response body for POST /admin/flush
#[derive(Debug, Clone, Serialize)]
pub struct FlushResponse {
    pub message: String,
    pub cleared: usize,
}

impl FlushResponse {
    pub fn new(cleared: usize) -> Self {
        Self {
            message: format!("Flushed {} keys", cleared),
            cleared,
        }
    }
}

/// Placement of one key on the ring
#[derive(Debug, Clone, Serialize)]
pub struct KeyPlacement {
    pub key: String,
    pub owner: Option<String>,
    pub replicas: Vec<String>,
}

/// Response body for GET /cluster/distribution and POST /cluster/rebalance
#[derive(Debug, Clone, Serialize)]
pub struct DistributionResponse {
    pub ring_size: usize,
    pub nodes: BTreeMap<String, NodeShare>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyPlacement>,
}

/// Response body for POST /cluster/nodes/join and POST /cluster/nodes/leave
#[derive(Debug, Clone, Serialize)]
pub struct MembershipResponse {
    pub message: String,
    pub node_id: String,
    pub distribution: BTreeMap<String, NodeShare>,
}
