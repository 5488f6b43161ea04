//! Configuration Module
//!
//! Handles loading and validating server configuration from environment
//! variables or a YAML file. Everything is parsed into typed fields once at
//! startup; a malformed value aborts startup instead of silently falling back
//! to the default.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{BackendKind, EvictionPolicy};

/// Environment variable naming a YAML config file. When set, the file is the
/// only source of configuration.
pub const CONFIG_FILE_ENV: &str = "CACHE_CONFIG_FILE";

// == Config Error ==
/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

// == Cluster Config ==
/// Cluster membership and replication parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Whether this node participates in a cluster
    pub enabled: bool,
    /// Peer node URLs (the node id is derived from the URL host)
    pub peers: Vec<String>,
    /// Ring points per physical node
    pub virtual_nodes: usize,
    /// Owner plus N-1 clockwise neighbours receive each write
    pub replication_factor: usize,
    /// Acknowledgments (a local primary write counts as one) required before
    /// a replicated write reports success
    pub min_replica_acks: usize,
    /// Seconds between health-check passes
    pub health_check_interval: u64,
    /// Seconds before a health probe counts as failed
    pub probe_timeout: u64,
    /// Seconds before a replication push counts as failed
    pub replication_timeout: u64,
    /// Shared secret for the node-to-node protocol
    pub replication_secret: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peers: Vec::new(),
            virtual_nodes: 100,
            replication_factor: 2,
            min_replica_acks: 1,
            health_check_interval: 30,
            probe_timeout: 5,
            replication_timeout: 10,
            replication_secret: None,
        }
    }
}

impl ClusterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout)
    }
}

// == Config ==
/// Server configuration parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Stable logical name of this node
    pub node_id: String,
    /// URL peers use to reach this node (defaults to `http://<node_id>:<port>`)
    pub advertised_url: Option<String>,
    /// Service version reported by health checks
    pub version: String,
    /// Storage engine, fixed for the lifetime of the process
    pub backend: BackendKind,
    /// Eviction policy for the memory backend
    pub eviction_policy: EvictionPolicy,
    /// Default TTL in seconds for memory entries set without one
    pub default_ttl: u64,
    /// Memory backend byte budget, in megabytes
    pub max_cache_size_mb: u64,
    /// Per-item byte budget, in kilobytes
    pub max_item_size_kb: u64,
    /// Key-value store connection URL
    pub redis_url: String,
    /// Seconds allowed for a single backend round trip
    pub backend_timeout: u64,
    /// SQLite file for the document backend (`:memory:` for ephemeral)
    pub document_path: String,
    /// Seconds between expiry-index sweeps in the document backend
    pub document_sweep_interval: u64,
    /// Seconds between maintenance cycles
    pub cleanup_interval: u64,
    /// Seconds to wait after a failed maintenance cycle
    pub cleanup_retry_delay: u64,
    /// Cluster settings
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8003,
            node_id: "cache-node-1".to_string(),
            advertised_url: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: BackendKind::Memory,
            eviction_policy: EvictionPolicy::Lru,
            default_ttl: 3600,
            max_cache_size_mb: 1024,
            max_item_size_kb: 1024,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend_timeout: 5,
            document_path: "cache.db".to_string(),
            document_sweep_interval: 60,
            cleanup_interval: 300,
            cleanup_retry_delay: 60,
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the YAML file named by `CACHE_CONFIG_FILE`,
    /// or from individual environment variables when it is unset.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_yaml_file(path),
            Err(_) => Self::from_env(),
        }
    }

    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT`, `NODE_ID`, `ADVERTISED_URL`
    /// - `CACHE_BACKEND` (memory | redis | document), `EVICTION_POLICY`
    /// - `DEFAULT_TTL`, `MAX_CACHE_SIZE_MB`, `MAX_ITEM_SIZE_KB`
    /// - `REDIS_URL`, `BACKEND_TIMEOUT`, `DOCUMENT_PATH`, `DOCUMENT_SWEEP_INTERVAL`
    /// - `CLEANUP_INTERVAL`, `CLEANUP_RETRY_DELAY`
    /// - `CLUSTER_ENABLED`, `CLUSTER_PEERS` (comma separated), `CLUSTER_VIRTUAL_NODES`,
    ///   `CLUSTER_REPLICATION_FACTOR`, `CLUSTER_MIN_REPLICA_ACKS`,
    ///   `CLUSTER_HEALTH_CHECK_INTERVAL`, `CLUSTER_PROBE_TIMEOUT`,
    ///   `CLUSTER_REPLICATION_TIMEOUT`, `REPLICATION_SECRET`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let cluster_defaults = ClusterConfig::default();

        let peers = lookup("CLUSTER_PEERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(cluster_defaults.peers);

        let config = Self {
            server_port: parse_var(&lookup, "SERVER_PORT", defaults.server_port)?,
            node_id: lookup("NODE_ID").unwrap_or(defaults.node_id),
            advertised_url: lookup("ADVERTISED_URL"),
            version: defaults.version,
            backend: parse_var(&lookup, "CACHE_BACKEND", defaults.backend)?,
            eviction_policy: parse_var(&lookup, "EVICTION_POLICY", defaults.eviction_policy)?,
            default_ttl: parse_var(&lookup, "DEFAULT_TTL", defaults.default_ttl)?,
            max_cache_size_mb: parse_var(&lookup, "MAX_CACHE_SIZE_MB", defaults.max_cache_size_mb)?,
            max_item_size_kb: parse_var(&lookup, "MAX_ITEM_SIZE_KB", defaults.max_item_size_kb)?,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            backend_timeout: parse_var(&lookup, "BACKEND_TIMEOUT", defaults.backend_timeout)?,
            document_path: lookup("DOCUMENT_PATH").unwrap_or(defaults.document_path),
            document_sweep_interval: parse_var(
                &lookup,
                "DOCUMENT_SWEEP_INTERVAL",
                defaults.document_sweep_interval,
            )?,
            cleanup_interval: parse_var(&lookup, "CLEANUP_INTERVAL", defaults.cleanup_interval)?,
            cleanup_retry_delay: parse_var(
                &lookup,
                "CLEANUP_RETRY_DELAY",
                defaults.cleanup_retry_delay,
            )?,
            cluster: ClusterConfig {
                enabled: parse_var(&lookup, "CLUSTER_ENABLED", cluster_defaults.enabled)?,
                peers,
                virtual_nodes: parse_var(
                    &lookup,
                    "CLUSTER_VIRTUAL_NODES",
                    cluster_defaults.virtual_nodes,
                )?,
                replication_factor: parse_var(
                    &lookup,
                    "CLUSTER_REPLICATION_FACTOR",
                    cluster_defaults.replication_factor,
                )?,
                min_replica_acks: parse_var(
                    &lookup,
                    "CLUSTER_MIN_REPLICA_ACKS",
                    cluster_defaults.min_replica_acks,
                )?,
                health_check_interval: parse_var(
                    &lookup,
                    "CLUSTER_HEALTH_CHECK_INTERVAL",
                    cluster_defaults.health_check_interval,
                )?,
                probe_timeout: parse_var(
                    &lookup,
                    "CLUSTER_PROBE_TIMEOUT",
                    cluster_defaults.probe_timeout,
                )?,
                replication_timeout: parse_var(
                    &lookup,
                    "CLUSTER_REPLICATION_TIMEOUT",
                    cluster_defaults.replication_timeout,
                )?,
                replication_secret: lookup("REPLICATION_SECRET"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document. Unknown fields are rejected.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    // == Validation ==
    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Validation("node_id cannot be empty".into()));
        }
        if self.max_cache_size_mb == 0 || self.max_item_size_kb == 0 {
            return Err(ConfigError::Validation(
                "cache and item size budgets must be positive".into(),
            ));
        }
        if self.max_item_bytes() > self.max_cache_bytes() {
            return Err(ConfigError::Validation(
                "max_item_size_kb exceeds max_cache_size_mb".into(),
            ));
        }
        if self.cleanup_interval == 0 || self.document_sweep_interval == 0 {
            return Err(ConfigError::Validation("intervals must be positive".into()));
        }
        if self.backend_timeout == 0 {
            return Err(ConfigError::Validation("backend_timeout must be positive".into()));
        }

        let cluster = &self.cluster;
        if cluster.virtual_nodes == 0 {
            return Err(ConfigError::Validation("virtual_nodes must be at least 1".into()));
        }
        if cluster.replication_factor == 0 {
            return Err(ConfigError::Validation(
                "replication_factor must be at least 1".into(),
            ));
        }
        if cluster.min_replica_acks == 0 || cluster.min_replica_acks > cluster.replication_factor
        {
            return Err(ConfigError::Validation(format!(
                "min_replica_acks must be between 1 and replication_factor ({})",
                cluster.replication_factor
            )));
        }
        if cluster.health_check_interval == 0
            || cluster.probe_timeout == 0
            || cluster.replication_timeout == 0
        {
            return Err(ConfigError::Validation(
                "cluster intervals and timeouts must be positive".into(),
            ));
        }
        if cluster.enabled
            && cluster
                .replication_secret
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "replication_secret is required when clustering is enabled".into(),
            ));
        }

        Ok(())
    }

    // == Derived Values ==
    pub fn max_cache_bytes(&self) -> usize {
        (self.max_cache_size_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn max_item_bytes(&self) -> usize {
        (self.max_item_size_kb as usize).saturating_mul(1024)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn cleanup_retry_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_retry_delay)
    }

    pub fn document_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.document_sweep_interval)
    }

    /// URL this node advertises to its peers.
    pub fn self_url(&self) -> String {
        self.advertised_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.node_id, self.server_port))
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => {
            let parsed = raw.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::InvalidValue {
                name,
                value: raw,
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 8003);
        assert_eq!(config.default_ttl, 3600);
        assert_eq!(config.cleanup_interval, 300);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.cluster.virtual_nodes, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.server_port, 8003);
        assert_eq!(config.node_id, "cache-node-1");
        assert!(!config.cluster.enabled);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CACHE_BACKEND", "document"),
            ("EVICTION_POLICY", "lfu"),
            ("CLUSTER_ENABLED", "true"),
            ("CLUSTER_PEERS", "http://cache-node-2:8003, http://cache-node-3:8003"),
            ("REPLICATION_SECRET", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.backend, BackendKind::Document);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.peers.len(), 2);
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("CLUSTER_VIRTUAL_NODES", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name: "CLUSTER_VIRTUAL_NODES", .. })
        ));

        let result = Config::from_lookup(lookup_from(&[("CACHE_BACKEND", "memcached")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_cluster_requires_secret() {
        let result = Config::from_lookup(lookup_from(&[("CLUSTER_ENABLED", "true")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_min_acks_bounded_by_replication_factor() {
        let mut config = Config::default();
        config.cluster.min_replica_acks = 3;
        config.cluster.replication_factor = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_rejects_unknown_fields() {
        let result = Config::from_yaml_str("server_port: 9000\nmystery_knob: 1\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_id: cache-node-7\nbackend: memory\neviction_policy: fifo\ncluster:\n  virtual_nodes: 50"
        )
        .unwrap();

        let config = Config::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.node_id, "cache-node-7");
        assert_eq!(config.eviction_policy, EvictionPolicy::Fifo);
        assert_eq!(config.cluster.virtual_nodes, 50);
        assert_eq!(config.cluster.replication_factor, 2);
    }

    #[test]
    fn test_self_url() {
        let config = Config::default();
        assert_eq!(config.self_url(), "http://cache-node-1:8003");
    }
}
