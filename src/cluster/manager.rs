//! Cluster Manager
//!
//! Owns the node table and the hash ring built from its online members.
//! Routes keys to owners, pushes writes to replicas, and runs the periodic
//! health-check loop that moves peers between `online` and `offline`.
//!
//! The ring lives behind an `Arc` that is swapped whole on every rebuild, so
//! a reader holding one sees a complete ring for the whole lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::KeyOwnership;
use crate::cluster::credential::ReplicationCredential;
use crate::cluster::load::LoadSampler;
use crate::cluster::node::{ClusterNode, NodeStatus};
use crate::cluster::ring::{HashRing, NodeShare};
use crate::cluster::transport::{HttpPeerTransport, PeerHealth, PeerTransport};
use crate::config::{ClusterConfig, Config};
use crate::error::{CacheError, Result};
use crate::models::{MsetRequest, ReplicateRequest};

/// Result of pushing one write to its replica set.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationOutcome {
    /// Owner first, then clockwise neighbours
    pub replicas: Vec<String>,
    pub acks: usize,
    pub required: usize,
    pub failed: Vec<String>,
    /// Pushes still in flight when the outcome was reported
    pub pending: Vec<String>,
    pub satisfied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub node_id: String,
    pub nodes: Vec<ClusterNode>,
    pub online_nodes: usize,
    pub ring_size: usize,
    pub virtual_nodes: usize,
    pub replication_factor: usize,
    pub min_replica_acks: usize,
    pub distribution: BTreeMap<String, NodeShare>,
}

/// Items split by owning node. Keys with no owner stay local.
#[derive(Debug)]
pub struct Partition<T> {
    pub local: Vec<(String, T)>,
    pub remote: HashMap<String, Vec<(String, T)>>,
}

// == Cluster Manager ==
pub struct ClusterManager {
    local_id: String,
    config: ClusterConfig,
    nodes: RwLock<BTreeMap<String, ClusterNode>>,
    ring: RwLock<Arc<HashRing>>,
    credential: ReplicationCredential,
    transport: Arc<dyn PeerTransport>,
    load: Arc<LoadSampler>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    pub fn new(
        local: ClusterNode,
        config: ClusterConfig,
        credential: ReplicationCredential,
        transport: Arc<dyn PeerTransport>,
        load: Arc<LoadSampler>,
    ) -> Arc<Self> {
        let local_id = local.id.clone();
        let mut nodes = BTreeMap::new();
        for url in &config.peers {
            let peer = ClusterNode::configured_peer(url.clone());
            if peer.id == local_id {
                continue;
            }
            nodes.insert(peer.id.clone(), peer);
        }
        nodes.insert(local_id.clone(), local);

        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            local_id,
            nodes: RwLock::new(nodes),
            ring: RwLock::new(Arc::new(HashRing::default())),
            credential,
            transport,
            load,
            shutdown_tx,
            health_task: Mutex::new(None),
            config,
        });
        manager.rebuild_ring();

        info!(
            node_id = %manager.local_id,
            peers = manager.nodes.read().len() - 1,
            virtual_nodes = manager.config.virtual_nodes,
            replication_factor = manager.config.replication_factor,
            "Cluster manager initialized"
        );
        manager
    }

    /// Builds the manager with the HTTP transport described by `config`.
    pub fn from_config(config: &Config, load: Arc<LoadSampler>) -> Result<Arc<Self>> {
        let secret = config
            .cluster
            .replication_secret
            .clone()
            .ok_or_else(|| CacheError::Internal("replication secret missing".into()))?;
        let credential = ReplicationCredential::new(secret);
        let transport = HttpPeerTransport::new(
            credential.clone(),
            config.cluster.probe_timeout(),
            config.cluster.replication_timeout(),
        )?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("backend".into(), Value::from(config.backend.to_string()));
        metadata.insert(
            "started_at".into(),
            Value::from(Utc::now().to_rfc3339()),
        );
        let local = ClusterNode::local(
            config.node_id.clone(),
            config.self_url(),
            config.version.clone(),
            metadata,
        );

        Ok(Self::new(
            local,
            config.cluster.clone(),
            credential,
            Arc::new(transport),
            load,
        ))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn replication_factor(&self) -> usize {
        self.config.replication_factor
    }

    /// Checks a token presented on a peer protocol request.
    pub fn verify_peer(&self, token: Option<&str>) -> bool {
        token.map_or(false, |t| self.credential.verify(t))
    }

    // == Lifecycle ==
    /// Spawns the health-check loop. The first pass runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.health_task.lock();
        if guard.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.health_check_interval();

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_health().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Health check loop stopped");
        }));
        info!(
            interval_secs = interval.as_secs(),
            "Health check loop started"
        );
    }

    /// Marks the local node `leaving`, drops it from the ring and stops the
    /// health loop. With no other node online the ring is empty and every
    /// lookup falls back to local-only mode.
    pub async fn shutdown(&self) {
        if let Some(local) = self.nodes.write().get_mut(&self.local_id) {
            local.status = NodeStatus::Leaving;
        }
        self.rebuild_ring();

        self.shutdown_tx.send_replace(true);
        let handle = self.health_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health check task ended abnormally");
            }
        }
        info!("Cluster manager shutdown complete");
    }

    // == Ring ==
    fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read())
    }

    /// Rebuilds the ring from the online nodes and swaps it in.
    pub fn rebuild_ring(&self) {
        let online: Vec<String> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.status.is_online())
            .map(|n| n.id.clone())
            .collect();
        let ring = HashRing::build(&online, self.config.virtual_nodes);
        debug!(
            online = online.len(),
            points = ring.len(),
            "Hash ring rebuilt"
        );
        *self.ring.write() = Arc::new(ring);
    }

    /// Owning node id, `None` when no node is online.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.ring().owner_of(key).map(str::to_string)
    }

    pub fn replica_set(&self, key: &str, n: usize) -> Vec<String> {
        self.ring().replica_set(key, n)
    }

    pub fn distribution(&self) -> BTreeMap<String, NodeShare> {
        self.ring().distribution()
    }

    pub fn ring_size(&self) -> usize {
        self.ring().len()
    }

    /// URL of the owning node when it is another online node.
    pub fn route(&self, key: &str) -> Option<String> {
        let owner = self.owner_of(key)?;
        if owner == self.local_id {
            return None;
        }
        self.nodes
            .read()
            .get(&owner)
            .filter(|n| n.status.is_online())
            .map(|n| n.url.clone())
    }

    /// Splits keyed items by owner.
    pub fn partition<T>(&self, items: impl IntoIterator<Item = (String, T)>) -> Partition<T> {
        let ring = self.ring();
        let mut partition = Partition {
            local: Vec::new(),
            remote: HashMap::new(),
        };
        for (key, item) in items {
            match ring.owner_of(&key) {
                Some(owner) if owner != self.local_id => partition
                    .remote
                    .entry(owner.to_string())
                    .or_default()
                    .push((key, item)),
                _ => partition.local.push((key, item)),
            }
        }
        partition
    }

    // == Membership ==
    pub fn node(&self, id: &str) -> Option<ClusterNode> {
        self.nodes.read().get(id).cloned()
    }

    fn online_peers(&self) -> Vec<ClusterNode> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.id != self.local_id && n.status.is_online())
            .cloned()
            .collect()
    }

    /// Adds a node in `joining` state. It enters the ring after its first
    /// successful health probe.
    pub fn join(
        &self,
        id: String,
        url: String,
        version: Option<String>,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<BTreeMap<String, NodeShare>> {
        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&id) {
                return Err(CacheError::NodeAlreadyExists(id));
            }
            info!(node = %id, url = %url, "Node joining cluster");
            nodes.insert(id.clone(), ClusterNode::joining(id, url, version, metadata));
        }
        self.rebuild_ring();
        Ok(self.distribution())
    }

    /// Removes a peer from the cluster. The local node cannot be removed.
    pub fn leave(&self, id: &str) -> Result<BTreeMap<String, NodeShare>> {
        if id == self.local_id {
            return Err(CacheError::InvalidRequest(
                "the local node cannot leave through its own API".into(),
            ));
        }
        let removed = self
            .nodes
            .write()
            .remove(id)
            .ok_or_else(|| CacheError::NodeNotFound(id.to_string()))?;
        info!(node = %id, last_status = %removed.status, "Node left cluster");
        self.rebuild_ring();
        Ok(self.distribution())
    }

    /// Forces a ring rebuild and reports the resulting distribution. No data
    /// is moved.
    pub fn rebalance(&self) -> BTreeMap<String, NodeShare> {
        self.rebuild_ring();
        let distribution = self.distribution();
        info!(nodes = distribution.len(), "Cluster rebalanced");
        distribution
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        self.refresh_local_load();
        let ring = self.ring();
        let nodes: Vec<ClusterNode> = self.nodes.read().values().cloned().collect();
        ClusterInfo {
            node_id: self.local_id.clone(),
            online_nodes: nodes.iter().filter(|n| n.status.is_online()).count(),
            nodes,
            ring_size: ring.len(),
            virtual_nodes: self.config.virtual_nodes,
            replication_factor: self.config.replication_factor,
            min_replica_acks: self.config.min_replica_acks,
            distribution: ring.distribution(),
        }
    }

    // == Health ==
    fn refresh_local_load(&self) {
        let load = self.load.sample();
        if let Some(local) = self.nodes.write().get_mut(&self.local_id) {
            local.load = load;
            local.last_seen = Some(Utc::now());
        }
    }

    /// Applies a probe result to the node table. Returns the updated record.
    fn apply_probe(&self, id: &str, result: Result<PeerHealth>) -> Option<ClusterNode> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(id)?;
        let previous = node.status;

        match result {
            Ok(health) if health.is_healthy() => {
                node.status = previous.after_probe(true);
                node.last_seen = Some(Utc::now());
                node.load = health.load;
                if let Some(version) = health.version {
                    node.version = version;
                }
            }
            Ok(health) => {
                node.status = previous.after_probe(false);
                debug!(node = %id, status = %health.status, "Peer reports unhealthy");
            }
            Err(e) => {
                node.status = previous.after_probe(false);
                debug!(node = %id, error = %e, "Peer probe failed");
            }
        }

        if node.status != previous {
            if node.status.is_online() {
                info!(node = %id, from = %previous, "Peer online");
            } else {
                warn!(node = %id, from = %previous, to = %node.status, "Peer status changed");
            }
        }
        Some(node.clone())
    }

    /// Probes every peer in parallel, then rebuilds the ring.
    pub async fn check_health(&self) {
        let peers: Vec<ClusterNode> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.id != self.local_id)
            .cloned()
            .collect();

        let results = join_all(peers.iter().map(|peer| self.transport.probe(peer))).await;
        for (peer, result) in peers.iter().zip(results) {
            self.apply_probe(&peer.id, result);
        }

        self.refresh_local_load();
        self.rebuild_ring();
    }

    /// Current record for `id`. Peers are probed on the spot.
    pub async fn node_health(&self, id: &str) -> Result<ClusterNode> {
        if id == self.local_id {
            self.refresh_local_load();
            return self
                .node(id)
                .ok_or_else(|| CacheError::NodeNotFound(id.to_string()));
        }

        let peer = self
            .node(id)
            .ok_or_else(|| CacheError::NodeNotFound(id.to_string()))?;
        let result = self.transport.probe(&peer).await;
        let updated = self
            .apply_probe(id, result)
            .ok_or_else(|| CacheError::NodeNotFound(id.to_string()))?;
        self.rebuild_ring();
        Ok(updated)
    }

    fn mark_unreachable(&self, id: &str, error: &CacheError) {
        let changed = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(node) if node.status.is_online() => {
                    node.status = node.status.after_probe(false);
                    true
                }
                _ => false,
            }
        };
        if changed {
            warn!(node = %id, error = %error, "Peer marked offline");
            self.rebuild_ring();
        }
    }

    // == Replication ==
    /// Pushes a write to the key's replica set.
    ///
    /// A successful local write counts as one acknowledgement. When that
    /// already meets `min_replica_acks` the peer pushes run in the
    /// background; otherwise they are awaited and counted.
    pub async fn replicate(
        self: &Arc<Self>,
        request: ReplicateRequest,
        local_written: bool,
    ) -> ReplicationOutcome {
        let replicas = self.replica_set(&request.key, self.config.replication_factor);
        let targets: Vec<ClusterNode> = {
            let nodes = self.nodes.read();
            replicas
                .iter()
                .filter(|id| **id != self.local_id)
                .filter_map(|id| nodes.get(id).cloned())
                .collect()
        };

        let acks = usize::from(local_written);
        let required = self
            .config
            .min_replica_acks
            .min(replicas.len().max(1));
        let target_ids: Vec<String> = targets.iter().map(|n| n.id.clone()).collect();

        if acks >= required {
            if !targets.is_empty() {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.push_to(&targets, &request).await;
                });
            }
            return ReplicationOutcome {
                replicas,
                acks,
                required,
                failed: Vec::new(),
                pending: target_ids,
                satisfied: true,
            };
        }

        let failed = self.push_to(&targets, &request).await;
        let acks = acks + targets.len() - failed.len();
        if acks < required {
            warn!(
                key = %request.key,
                acks,
                required,
                "Replicated write below required acknowledgements"
            );
        }
        ReplicationOutcome {
            replicas,
            acks,
            required,
            failed,
            pending: Vec::new(),
            satisfied: acks >= required,
        }
    }

    /// Sends `request` to every target in parallel. Returns the ids that
    /// failed; those nodes are marked offline.
    async fn push_to(&self, targets: &[ClusterNode], request: &ReplicateRequest) -> Vec<String> {
        let results = join_all(
            targets
                .iter()
                .map(|node| self.transport.replicate(node, request)),
        )
        .await;

        let mut failed = Vec::new();
        for (node, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => debug!(key = %request.key, node = %node.id, "Replicated"),
                Err(e) => {
                    self.mark_unreachable(&node.id, &e);
                    failed.push(node.id.clone());
                }
            }
        }
        failed
    }

    // == Fan-out ==
    /// Fetches keys from their owners. Returns the values found plus the
    /// keys whose owner could not be reached.
    pub async fn mget_remote(
        &self,
        by_node: HashMap<String, Vec<String>>,
    ) -> (HashMap<String, Option<Value>>, Vec<String>) {
        let mut requests = Vec::new();
        let mut unreachable = Vec::new();
        for (id, keys) in by_node {
            match self.node(&id) {
                Some(node) => requests.push((node, keys)),
                None => unreachable.extend(keys),
            }
        }

        let results = join_all(
            requests
                .iter()
                .map(|(node, keys)| self.transport.mget(node, keys)),
        )
        .await;

        let mut values = HashMap::new();
        for ((node, keys), result) in requests.into_iter().zip(results) {
            match result {
                Ok(found) => {
                    for key in keys {
                        let value = found.get(&key).cloned().flatten();
                        values.insert(key, value);
                    }
                }
                Err(e) => {
                    self.mark_unreachable(&node.id, &e);
                    unreachable.extend(keys);
                }
            }
        }
        (values, unreachable)
    }

    /// Stores items on their owners. Returns the count stored remotely and
    /// the items whose owner could not be reached.
    pub async fn mset_remote(
        &self,
        by_node: HashMap<String, Vec<(String, Value)>>,
        ttl: Option<u64>,
        tags: &HashMap<String, Vec<String>>,
    ) -> (usize, Vec<(String, Value)>) {
        let mut requests = Vec::new();
        let mut unsent = Vec::new();
        for (id, items) in by_node {
            let Some(node) = self.node(&id) else {
                unsent.extend(items);
                continue;
            };
            let node_tags = items
                .iter()
                .filter_map(|(key, _)| tags.get(key).map(|t| (key.clone(), t.clone())))
                .collect();
            let request = MsetRequest {
                items: items.iter().cloned().collect(),
                ttl,
                tags: node_tags,
            };
            requests.push((node, items, request));
        }

        let results = join_all(
            requests
                .iter()
                .map(|(node, _, request)| self.transport.mset(node, request)),
        )
        .await;

        let mut stored = 0;
        for ((node, items, _), result) in requests.into_iter().zip(results) {
            match result {
                Ok(count) => stored += count,
                Err(e) => {
                    self.mark_unreachable(&node.id, &e);
                    unsent.extend(items);
                }
            }
        }
        (stored, unsent)
    }

    /// Clears `pattern` on every online peer. Returns the total removed.
    pub async fn clear_peers(&self, pattern: &str) -> usize {
        let peers = self.online_peers();
        let results = join_all(peers.iter().map(|node| self.transport.clear(node, pattern))).await;

        let mut cleared = 0;
        for (node, result) in peers.iter().zip(results) {
            match result {
                Ok(count) => cleared += count,
                Err(e) => warn!(node = %node.id, error = %e, "Peer clear failed"),
            }
        }
        cleared
    }
}

impl KeyOwnership for ClusterManager {
    /// Local-only when the ring is empty.
    fn is_owner(&self, key: &str) -> bool {
        self.ring()
            .owner_of(key)
            .map_or(true, |owner| owner == self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoPeers;

    #[async_trait]
    impl PeerTransport for NoPeers {
        async fn probe(&self, node: &ClusterNode) -> Result<PeerHealth> {
            Err(CacheError::PeerUnreachable {
                node: node.id.clone(),
                reason: "down".into(),
            })
        }

        async fn replicate(&self, node: &ClusterNode, _: &ReplicateRequest) -> Result<()> {
            Err(CacheError::PeerUnreachable {
                node: node.id.clone(),
                reason: "down".into(),
            })
        }

        async fn mget(
            &self,
            _: &ClusterNode,
            _: &[String],
        ) -> Result<HashMap<String, Option<Value>>> {
            Ok(HashMap::new())
        }

        async fn mset(&self, _: &ClusterNode, _: &MsetRequest) -> Result<usize> {
            Ok(0)
        }

        async fn clear(&self, _: &ClusterNode, _: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn manager(peers: &[&str]) -> Arc<ClusterManager> {
        let config = ClusterConfig {
            enabled: true,
            peers: peers.iter().map(|p| p.to_string()).collect(),
            virtual_nodes: 50,
            replication_secret: Some("s".into()),
            ..ClusterConfig::default()
        };
        ClusterManager::new(
            ClusterNode::local("n1", "http://n1:8003", "0.1.0", Default::default()),
            config,
            ReplicationCredential::new("s"),
            Arc::new(NoPeers),
            Arc::new(LoadSampler::new()),
        )
    }

    #[test]
    fn test_configured_peers_start_outside_ring() {
        let cluster = manager(&["http://n2:8003", "http://n3:8003"]);
        assert_eq!(cluster.node("n2").unwrap().status, NodeStatus::Unknown);
        assert_eq!(cluster.distribution().len(), 1);
        assert_eq!(cluster.owner_of("any").as_deref(), Some("n1"));
    }

    #[test]
    fn test_self_in_peer_list_is_skipped() {
        let cluster = manager(&["http://n1:8003"]);
        assert_eq!(cluster.cluster_info().nodes.len(), 1);
    }

    #[test]
    fn test_join_and_leave() {
        let cluster = manager(&[]);
        cluster
            .join("n9".into(), "http://n9:8003".into(), None, Default::default())
            .unwrap();
        assert!(matches!(
            cluster.join("n9".into(), "http://n9:8003".into(), None, Default::default()),
            Err(CacheError::NodeAlreadyExists(_))
        ));
        assert_eq!(cluster.node("n9").unwrap().status, NodeStatus::Joining);

        cluster.leave("n9").unwrap();
        assert!(cluster.node("n9").is_none());
        assert!(matches!(cluster.leave("n9"), Err(CacheError::NodeNotFound(_))));
        assert!(matches!(cluster.leave("n1"), Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_failed_probe_marks_offline() {
        let cluster = manager(&["http://n2:8003"]);
        cluster.check_health().await;
        assert_eq!(cluster.node("n2").unwrap().status, NodeStatus::Offline);

        let node = cluster.node_health("n2").await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(cluster.node_health("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_local_write_satisfies_single_ack() {
        let cluster = manager(&[]);
        let outcome = cluster
            .replicate(
                ReplicateRequest {
                    key: "k".into(),
                    value: Value::from(1),
                    ttl: None,
                    tags: vec![],
                },
                true,
            )
            .await;
        assert!(outcome.satisfied);
        assert_eq!(outcome.acks, 1);
        assert_eq!(outcome.replicas, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_shutdown_empties_ring_and_falls_back_to_local() {
        let cluster = manager(&[]);
        cluster.start();
        cluster.shutdown().await;

        assert_eq!(cluster.owner_of("k"), None);
        assert!(cluster.is_owner("k"));
        assert_eq!(cluster.route("k"), None);
    }

    #[test]
    fn test_partition_without_peers_is_local() {
        let cluster = manager(&[]);
        let partition = cluster.partition(vec![("a".to_string(), ()), ("b".to_string(), ())]);
        assert_eq!(partition.local.len(), 2);
        assert!(partition.remote.is_empty());
    }

    #[test]
    fn test_verify_peer() {
        let cluster = manager(&[]);
        let token = ReplicationCredential::new("s").token();
        assert!(cluster.verify_peer(Some(&token)));
        assert!(!cluster.verify_peer(Some("nope")));
        assert!(!cluster.verify_peer(None));
    }
}
