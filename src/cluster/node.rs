//! Cluster Node Module
//!
//! Membership record for one node and its status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// == Node Status ==
/// `unknown -> joining -> online <-> offline`, with `leaving` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Unknown,
    Joining,
    Online,
    Offline,
    Leaving,
}

impl NodeStatus {
    /// Status after a health probe. A leaving node stays leaving.
    pub fn after_probe(self, healthy: bool) -> NodeStatus {
        match (self, healthy) {
            (NodeStatus::Leaving, _) => NodeStatus::Leaving,
            (_, true) => NodeStatus::Online,
            (_, false) => NodeStatus::Offline,
        }
    }

    pub fn is_online(self) -> bool {
        self == NodeStatus::Online
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Joining => "joining",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

// == Cluster Node ==
#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    /// Stable logical name, unique across the cluster
    pub id: String,
    pub url: String,
    pub status: NodeStatus,
    /// Last successful health probe
    pub last_seen: Option<DateTime<Utc>>,
    /// 0-100 blend of CPU and memory utilization
    pub load: f64,
    pub version: String,
    pub metadata: Map<String, Value>,
}

impl ClusterNode {
    /// Record for this process. Always online.
    pub fn local(
        id: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            status: NodeStatus::Online,
            last_seen: Some(Utc::now()),
            load: 0.0,
            version: version.into(),
            metadata,
        }
    }

    /// Peer known from static configuration, not yet probed.
    pub fn configured_peer(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: node_id_from_url(&url),
            url,
            status: NodeStatus::Unknown,
            last_seen: None,
            load: 0.0,
            version: "unknown".to_string(),
            metadata: Map::new(),
        }
    }

    /// Peer added through an explicit join.
    pub fn joining(
        id: impl Into<String>,
        url: impl Into<String>,
        version: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            status: NodeStatus::Joining,
            last_seen: None,
            load: 0.0,
            version: version.unwrap_or_else(|| "unknown".to_string()),
            metadata,
        }
    }
}

/// Derives a node id from its URL host: `http://cache-node-2:8003` gives
/// `cache-node-2`.
pub fn node_id_from_url(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?']).next().unwrap_or(rest);
    host.split(':').next().unwrap_or(host).to_string()
}
