//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies and query strings.
//! The peer protocol bodies also derive `Serialize` so the peer transport
//! can send them.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{MATCH_ALL, MAX_BATCH_SIZE, MAX_KEY_LENGTH};

/// Default `limit` for key listings
pub const DEFAULT_KEYS_LIMIT: usize = 1000;

/// Default page size for GET /admin/monitor/keys
pub const DEFAULT_MONITOR_LIMIT: usize = 100;

fn validate_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return Some("Key cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LENGTH {
        return Some(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        ));
    }
    None
}

fn ttl_from_secs(ttl: Option<u64>) -> Option<Duration> {
    ttl.map(Duration::from_secs)
}

/// Request body for PUT /cache/:key
///
/// # Fields
/// - `value`: Any JSON value
/// - `ttl`: Optional TTL in seconds
/// - `tags`: Optional invalidation tags (replace existing tags)
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SetRequest {
    pub fn ttl(&self) -> Option<Duration> {
        ttl_from_secs(self.ttl)
    }
}

/// Request body for POST /cache/mget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgetRequest {
    pub keys: Vec<String>,
}

impl MgetRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.keys.len() > MAX_BATCH_SIZE {
            return Some(format!("Too many keys (max {})", MAX_BATCH_SIZE));
        }
        self.keys.iter().find_map(|key| validate_key(key))
    }
}

/// Request body for POST /cache/mset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsetRequest {
    pub items: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl MsetRequest {
    pub fn validate(&self) -> Option<String> {
        if self.items.len() > MAX_BATCH_SIZE {
            return Some(format!("Too many items (max {})", MAX_BATCH_SIZE));
        }
        self.items.keys().find_map(|key| validate_key(key))
    }

    pub fn ttl(&self) -> Option<Duration> {
        ttl_from_secs(self.ttl)
    }
}

/// Query for GET /cache/keys
#[derive(Debug, Clone, Deserialize)]
pub struct KeysQuery {
    #[serde(default = "match_all")]
    pub pattern: String,
    #[serde(default = "default_keys_limit")]
    pub limit: usize,
}

/// Query for DELETE /cache/clear
#[derive(Debug, Clone, Deserialize)]
pub struct ClearQuery {
    #[serde(default = "match_all")]
    pub pattern: String,
}

fn match_all() -> String {
    MATCH_ALL.to_string()
}

fn default_keys_limit() -> usize {
    DEFAULT_KEYS_LIMIT
}

/// Encoding of an export dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Msgpack,
}

/// Query for GET /admin/export
#[derive(Debug, Clone, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_keys_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Key,
    Size,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Query for GET /admin/monitor/keys
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorKeysQuery {
    #[serde(default = "default_monitor_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_monitor_limit() -> usize {
    DEFAULT_MONITOR_LIMIT
}

/// Request body for POST /cache/invalidate/tags
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateTagsRequest {
    pub tags: Vec<String>,
}

/// Request body for POST /cache/replicate (node to node)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ReplicateRequest {
    pub fn validate(&self) -> Option<String> {
        validate_key(&self.key)
    }

    pub fn ttl(&self) -> Option<Duration> {
        ttl_from_secs(self.ttl)
    }
}

/// Checks a key taken from the URL path.
pub fn validate_path_key(key: &str) -> Option<String> {
    validate_key(key)
}

/// Request body for POST /cluster/nodes/join
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JoinRequest {
    pub fn validate(&self) -> Option<String> {
        if self.id.trim().is_empty() {
            return Some("Node id cannot be empty".to_string());
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Some("Node url must start with http:// or https://".to_string());
        }
        None
    }
}

/// Request body for POST /cluster/nodes/leave
#[derive(Debug, Clone, Deserialize)]
pub struct LeaveRequest {
    pub id: String,
}

/// Query for GET /cluster/distribution
#[derive(Debug, Clone, Deserialize)]
pub struct DistributionQuery {
    #[serde(default)]
    pub key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_request_deserialize() {
        let json = r#"{"value": {"hits": 3}}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.value["hits"], 3);
        assert!(req.ttl().is_none());
        assert!(req.tags.is_empty());
    }

    #[test]
    fn test_set_request_with_ttl_and_tags() {
        let json = r#"{"value": "v", "ttl": 60, "tags": ["lang"]}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(req.tags, vec!["lang"]);
    }

    #[test]
    fn test_mget_batch_cap() {
        let req = MgetRequest {
            keys: (0..=MAX_BATCH_SIZE).map(|i| i.to_string()).collect(),
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_empty_key() {
        let req = ReplicateRequest {
            key: String::new(),
            value: Value::Null,
            ttl: None,
            tags: vec![],
        };
        assert!(req.validate().is_some());
        assert!(validate_path_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_some());
    }

    #[test]
    fn test_keys_query_defaults() {
        let query: KeysQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.pattern, "*");
        assert_eq!(query.limit, DEFAULT_KEYS_LIMIT);
    }

    #[test]
    fn test_admin_query_defaults() {
        let export: ExportQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(export.format, ExportFormat::Json);
        assert_eq!(export.limit, DEFAULT_KEYS_LIMIT);

        let monitor: MonitorKeysQuery =
            serde_json::from_str(r#"{"sort_by": "size", "order": "desc"}"#).unwrap();
        assert_eq!(monitor.limit, DEFAULT_MONITOR_LIMIT);
        assert_eq!(monitor.offset, 0);
        assert_eq!(monitor.sort_by, SortField::Size);
        assert_eq!(monitor.order, SortOrder::Desc);
    }

    #[test]
    fn test_join_request_validation() {
        let req: JoinRequest =
            serde_json::from_str(r#"{"id": "n4", "url": "cache-node-4:8003"}"#).unwrap();
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_replicate_request_skips_empty_fields() {
        let req = ReplicateRequest {
            key: "k".into(),
            value: Value::from(1),
            ttl: None,
            tags: vec![],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("ttl").is_none());
        assert!(json.get("tags").is_none());
    }
}
