//! Cluster Tests
//!
//! Drives the cluster manager, alone and behind the router, with an
//! in-memory peer transport standing in for the other nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use techstats_cache::{
    api::create_router,
    cache::{EvictionPolicy, KeyOwnership, KeyPattern, MemoryBackend},
    cluster::{
        ClusterManager, ClusterNode, LoadSampler, NodeStatus, PeerHealth, PeerTransport,
        ReplicationCredential, REPLICATION_HEADER,
    },
    config::ClusterConfig,
    models::{MsetRequest, ReplicateRequest},
    AppState, CacheError, Config, Result,
};
use tower::ServiceExt;

const SECRET: &str = "cluster-test-secret";

// == Fake Peers ==

/// Peers that live in this process. Each peer id maps to its own store.
#[derive(Default)]
struct FakePeers {
    down: Mutex<HashSet<String>>,
    stores: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl FakePeers {
    fn take_down(&self, id: &str) {
        self.down.lock().insert(id.to_string());
    }

    fn bring_up(&self, id: &str) {
        self.down.lock().remove(id);
    }

    fn put(&self, node: &str, key: &str, value: Value) {
        self.stores
            .lock()
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn stored(&self, node: &str, key: &str) -> Option<Value> {
        self.stores.lock().get(node)?.get(key).cloned()
    }

    fn reachable(&self, node: &ClusterNode) -> Result<()> {
        if self.down.lock().contains(&node.id) {
            Err(CacheError::PeerUnreachable {
                node: node.id.clone(),
                reason: "connection refused".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for FakePeers {
    async fn probe(&self, node: &ClusterNode) -> Result<PeerHealth> {
        self.reachable(node)?;
        Ok(serde_json::from_value(json!({"status": "healthy", "version": "9.9.9", "load": 5.0}))
            .unwrap())
    }

    async fn replicate(&self, node: &ClusterNode, request: &ReplicateRequest) -> Result<()> {
        self.reachable(node)?;
        self.put(&node.id, &request.key, request.value.clone());
        Ok(())
    }

    async fn mget(
        &self,
        node: &ClusterNode,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Value>>> {
        self.reachable(node)?;
        Ok(keys
            .iter()
            .map(|k| (k.clone(), self.stored(&node.id, k)))
            .collect())
    }

    async fn mset(&self, node: &ClusterNode, request: &MsetRequest) -> Result<usize> {
        self.reachable(node)?;
        for (key, value) in &request.items {
            self.put(&node.id, key, value.clone());
        }
        Ok(request.items.len())
    }

    async fn clear(&self, node: &ClusterNode, pattern: &str) -> Result<usize> {
        self.reachable(node)?;
        let pattern = KeyPattern::new(pattern)?;
        let mut stores = self.stores.lock();
        let store = stores.entry(node.id.clone()).or_default();
        let before = store.len();
        store.retain(|key, _| !pattern.matches(key));
        Ok(before - store.len())
    }
}

// == Helper Functions ==

fn cluster_with(peers: &[&str], fake: Arc<FakePeers>, min_replica_acks: usize) -> Arc<ClusterManager> {
    let config = ClusterConfig {
        enabled: true,
        peers: peers.iter().map(|id| format!("http://{}:8003", id)).collect(),
        virtual_nodes: 100,
        replication_factor: 2,
        min_replica_acks,
        replication_secret: Some(SECRET.to_string()),
        ..ClusterConfig::default()
    };
    ClusterManager::new(
        ClusterNode::local("n1", "http://n1:8003", "test", Map::new()),
        config,
        ReplicationCredential::new(SECRET),
        fake,
        Arc::new(LoadSampler::new()),
    )
}

fn app_for(cluster: Arc<ClusterManager>) -> Router {
    let config = Config {
        node_id: "n1".to_string(),
        ..Config::default()
    };
    let backend = MemoryBackend::new(1024 * 1024, 64 * 1024, EvictionPolicy::Lru, None);
    let state = AppState::assemble(
        config,
        Arc::new(backend),
        Some(cluster),
        Arc::new(LoadSampler::new()),
    );
    create_router(state)
}

/// First `key:<i>` the ring places on `owner`.
fn key_owned_by(cluster: &ClusterManager, owner: &str) -> String {
    prefixed_key_owned_by(cluster, owner, "key:")
}

/// First `<prefix><i>` the ring places on `owner`.
fn prefixed_key_owned_by(cluster: &ClusterManager, owner: &str, prefix: &str) -> String {
    (0..10_000)
        .map(|i| format!("{}{}", prefix, i))
        .find(|key| cluster.owner_of(key).as_deref() == Some(owner))
        .expect("some key lands on every node")
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    peer: bool,
) -> (StatusCode, HashMap<String, String>, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if peer {
        builder = builder.header(REPLICATION_HEADER, ReplicationCredential::new(SECRET).token());
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

// == Membership and Ring ==

#[tokio::test]
async fn test_health_pass_brings_peers_online() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    assert_eq!(cluster.distribution().len(), 1);

    cluster.check_health().await;

    let n2 = cluster.node("n2").unwrap();
    assert_eq!(n2.status, NodeStatus::Online);
    assert_eq!(n2.version, "9.9.9");
    assert!(n2.last_seen.is_some());
    assert_eq!(cluster.cluster_info().online_nodes, 3);
    assert_eq!(cluster.distribution().len(), 3);
}

#[tokio::test]
async fn test_three_nodes_share_the_ring_and_removal_redistributes() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake, 1);
    cluster.check_health().await;

    let distribution = cluster.distribution();
    for share in distribution.values() {
        assert!(
            (share.percentage - 33.3).abs() < 12.0,
            "unbalanced share: {}",
            share.percentage
        );
    }
    assert_eq!(cluster.ring_size(), 300);

    cluster.leave("n3").unwrap();
    let distribution = cluster.distribution();
    assert_eq!(distribution.len(), 2);
    for share in distribution.values() {
        assert!((share.percentage - 50.0).abs() < 15.0);
    }
}

#[tokio::test]
async fn test_owner_is_stable_without_membership_change() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake, 1);
    cluster.check_health().await;

    for i in 0..200 {
        let key = format!("stable:{}", i);
        let first = cluster.owner_of(&key);
        assert!(first.is_some());
        assert_eq!(cluster.owner_of(&key), first);
        cluster.rebalance();
        assert_eq!(cluster.owner_of(&key), first);
    }
}

#[tokio::test]
async fn test_joining_node_waits_for_first_probe() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&[], fake, 1);

    cluster
        .join("n4".into(), "http://n4:8003".into(), None, Map::new())
        .unwrap();
    assert_eq!(cluster.node("n4").unwrap().status, NodeStatus::Joining);
    assert!(!cluster.distribution().contains_key("n4"));

    let node = cluster.node_health("n4").await.unwrap();
    assert_eq!(node.status, NodeStatus::Online);
    assert!(cluster.distribution().contains_key("n4"));
}

#[tokio::test]
async fn test_offline_peer_leaves_the_ring() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    cluster.check_health().await;

    fake.take_down("n2");
    cluster.check_health().await;
    assert_eq!(cluster.node("n2").unwrap().status, NodeStatus::Offline);
    assert!(!cluster.distribution().contains_key("n2"));

    fake.bring_up("n2");
    cluster.check_health().await;
    assert_eq!(cluster.node("n2").unwrap().status, NodeStatus::Online);
}

#[tokio::test]
async fn test_empty_ring_means_local_only() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2"], fake.clone(), 1);
    fake.take_down("n2");
    cluster.check_health().await;
    cluster.shutdown().await;

    assert_eq!(cluster.ring_size(), 0);
    assert_eq!(cluster.owner_of("anything"), None);
    assert!(cluster.is_owner("anything"));
    assert_eq!(cluster.route("anything"), None);
    assert!(cluster.replica_set("anything", 2).is_empty());
}

// == Replication ==

#[tokio::test]
async fn test_write_succeeds_with_one_replica_offline() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    cluster.check_health().await;

    let key = key_owned_by(&cluster, "n1");
    let replicas = cluster.replica_set(&key, 2);
    assert_eq!(replicas[0], "n1");
    let replica = replicas[1].clone();
    fake.take_down(&replica);

    let app = app_for(cluster.clone());
    let (status, _, json) = send(
        &app,
        "PUT",
        &format!("/cache/{}", key),
        Some(json!({"value": {"hits": 3}})),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["replication"]["satisfied"], true);
    assert_eq!(json["replication"]["acks"], 1);

    let (status, _, json) = send(&app, "GET", &format!("/cache/{}", key), None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["value"]["hits"], 3);

    // The background push fails and takes the replica out of the ring.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.node(&replica).unwrap().status, NodeStatus::Offline);
}

#[tokio::test]
async fn test_write_reaches_online_replica() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 2);
    cluster.check_health().await;

    let key = key_owned_by(&cluster, "n1");
    let replica = cluster.replica_set(&key, 2)[1].clone();

    let outcome = cluster
        .replicate(
            ReplicateRequest {
                key: key.clone(),
                value: json!("v"),
                ttl: Some(60),
                tags: vec![],
            },
            true,
        )
        .await;
    assert!(outcome.satisfied);
    assert_eq!(outcome.acks, 2);
    assert!(outcome.pending.is_empty());
    assert_eq!(fake.stored(&replica, &key), Some(json!("v")));
}

#[tokio::test]
async fn test_required_acks_not_met() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 2);
    cluster.check_health().await;

    let key = key_owned_by(&cluster, "n1");
    let replica = cluster.replica_set(&key, 2)[1].clone();
    fake.take_down(&replica);

    let outcome = cluster
        .replicate(
            ReplicateRequest {
                key,
                value: json!("v"),
                ttl: None,
                tags: vec![],
            },
            true,
        )
        .await;
    assert!(!outcome.satisfied);
    assert_eq!(outcome.failed, vec![replica.clone()]);
    assert_eq!(cluster.node(&replica).unwrap().status, NodeStatus::Offline);
}

// == Routing Through the API ==

#[tokio::test]
async fn test_get_redirects_to_owner() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake, 1);
    cluster.check_health().await;
    let key = key_owned_by(&cluster, "n2");
    let own_key = key_owned_by(&cluster, "n1");
    let app = app_for(cluster);

    // Keys this node owns are answered here.
    let (status, _, _) = send(&app, "GET", &format!("/cache/{}", own_key), None, false).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, headers, _) = send(&app, "GET", &format!("/cache/{}", key), None, false).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        headers[header::LOCATION.as_str()],
        format!("http://n2:8003/cache/{}", key)
    );

    // Peers are served locally: no forwarding loops.
    let (status, _, _) = send(&app, "GET", &format!("/cache/{}", key), None, true).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_redirect_encodes_key_as_one_path_segment() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake, 1);
    cluster.check_health().await;

    // (raw prefix, prefix as sent in the request path, prefix in Location)
    let cases = [
        ("line\n", "line%0A", "line%0A"),
        ("q?x=", "q%3Fx=", "q%3Fx="),
        ("frag#", "frag%23", "frag%23"),
        ("ключ:", "%D0%BA%D0%BB%D1%8E%D1%87:", "%D0%BA%D0%BB%D1%8E%D1%87:"),
    ];
    let keys: Vec<String> = cases
        .iter()
        .map(|(raw, _, _)| prefixed_key_owned_by(&cluster, "n2", raw))
        .collect();
    let app = app_for(cluster);

    for ((raw, sent, encoded), key) in cases.iter().zip(&keys) {
        let suffix = &key[raw.len()..];
        let uri = format!("/cache/{}{}", sent, suffix);

        let (status, headers, _) = send(&app, "GET", &uri, None, false).await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT, "key {:?}", key);
        assert_eq!(
            headers[header::LOCATION.as_str()],
            format!("http://n2:8003/cache/{}{}", encoded, suffix)
        );
    }
}

#[tokio::test]
async fn test_mget_and_mset_fan_out_by_owner() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    cluster.check_health().await;

    let local_key = key_owned_by(&cluster, "n1");
    let remote_key = key_owned_by(&cluster, "n2");
    let app = app_for(cluster);

    let (status, _, json) = send(
        &app,
        "POST",
        "/cache/mset",
        Some(json!({"items": {local_key.clone(): 1, remote_key.clone(): 2}})),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stored"], 2);
    assert_eq!(fake.stored("n2", &remote_key), Some(json!(2)));

    let (_, _, json) = send(
        &app,
        "POST",
        "/cache/mget",
        Some(json!({"keys": [local_key.clone(), remote_key.clone(), "nowhere"]})),
        false,
    )
    .await;
    assert_eq!(json["values"][&local_key], 1);
    assert_eq!(json["values"][&remote_key], 2);
    assert_eq!(json["values"].as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_mget_falls_back_to_local_when_owner_down() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    cluster.check_health().await;
    let remote_key = key_owned_by(&cluster, "n2");
    fake.take_down("n2");
    let app = app_for(cluster);

    // A peer-credentialed write stores locally regardless of ownership.
    send(
        &app,
        "PUT",
        &format!("/cache/{}", remote_key),
        Some(json!({"value": "replica copy"})),
        true,
    )
    .await;

    let (_, _, json) = send(
        &app,
        "POST",
        "/cache/mget",
        Some(json!({"keys": [remote_key.clone()]})),
        false,
    )
    .await;
    assert_eq!(json["values"][&remote_key], "replica copy");
}

#[tokio::test]
async fn test_clear_fans_out_to_online_peers() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2", "n3"], fake.clone(), 1);
    cluster.check_health().await;
    fake.put("n2", "search:a", json!(1));
    fake.put("n3", "search:b", json!(1));
    fake.put("n3", "other", json!(1));
    let app = app_for(cluster);

    let (status, _, json) = send(&app, "DELETE", "/cache/clear?pattern=search:*", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["peers_cleared"], 2);
    assert_eq!(fake.stored("n3", "other"), Some(json!(1)));
}

#[tokio::test]
async fn test_replicate_endpoint_accepts_valid_credential() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&[], fake, 1);
    let app = app_for(cluster);

    let (status, _, json) = send(
        &app,
        "POST",
        "/cache/replicate",
        Some(json!({"key": "pushed", "value": {"n": 1}, "ttl": 60})),
        true,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, _, json) = send(&app, "GET", "/cache/pushed", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["value"]["n"], 1);
}

#[tokio::test]
async fn test_cluster_endpoints() {
    let fake = Arc::new(FakePeers::default());
    let cluster = cluster_with(&["n2"], fake, 1);
    cluster.check_health().await;
    let app = app_for(cluster);

    let (status, _, json) = send(&app, "GET", "/cluster/info", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["node_id"], "n1");
    assert_eq!(json["online_nodes"], 2);
    assert_eq!(json["ring_size"], 200);

    let (_, _, json) = send(&app, "GET", "/cluster/distribution?key=tech:python", None, false).await;
    assert_eq!(json["key"]["replicas"].as_array().unwrap().len(), 2);
    assert!(json["nodes"]["n1"]["percentage"].as_f64().unwrap() > 0.0);

    let (status, _, _) = send(
        &app,
        "POST",
        "/cluster/nodes/join",
        Some(json!({"id": "n2", "url": "http://n2:8003"})),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, json) = send(&app, "GET", "/cluster/nodes/n2/health", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "online");

    let (status, _, json) = send(
        &app,
        "POST",
        "/cluster/nodes/leave",
        Some(json!({"id": "n2"})),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["distribution"]["n1"]["percentage"], 100.0);

    let (status, _, _) = send(&app, "GET", "/cluster/nodes/n2/health", None, false).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
