//! Peer Transport
//!
//! The requests one node issues to another: health probe, replication push,
//! and the mget/mset/clear fan-out. Every call carries its own timeout and
//! any failure, timeout included, comes back as `PeerUnreachable`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cluster::credential::{ReplicationCredential, REPLICATION_HEADER};
use crate::cluster::node::ClusterNode;
use crate::error::{CacheError, Result};
use crate::models::{
    ClearResponse, MgetRequest, MgetResponse, MsetRequest, MsetResponse, ReplicateRequest,
};

/// Subset of a peer's `/health` body used to update its node record.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub load: f64,
}

impl PeerHealth {
    /// A degraded peer still serves traffic.
    pub fn is_healthy(&self) -> bool {
        self.status != "unhealthy"
    }
}

// == Peer Transport Trait ==
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn probe(&self, node: &ClusterNode) -> Result<PeerHealth>;

    async fn replicate(&self, node: &ClusterNode, request: &ReplicateRequest) -> Result<()>;

    async fn mget(
        &self,
        node: &ClusterNode,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Value>>>;

    /// Returns the number of items the peer stored.
    async fn mset(&self, node: &ClusterNode, request: &MsetRequest) -> Result<usize>;

    /// Returns the number of keys the peer removed.
    async fn clear(&self, node: &ClusterNode, pattern: &str) -> Result<usize>;
}

// == HTTP Transport ==
pub struct HttpPeerTransport {
    client: Client,
    credential: ReplicationCredential,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpPeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPeerTransport")
            .field("probe_timeout", &self.probe_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn unreachable(node: &ClusterNode, reason: impl std::fmt::Display) -> CacheError {
    CacheError::PeerUnreachable {
        node: node.id.clone(),
        reason: reason.to_string(),
    }
}

fn endpoint(node: &ClusterNode, path: &str) -> String {
    format!("{}{}", node.url.trim_end_matches('/'), path)
}

impl HttpPeerTransport {
    pub fn new(
        credential: ReplicationCredential,
        probe_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("techstats-cache/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credential,
            probe_timeout,
            request_timeout,
        })
    }

    /// Peer protocol request: credential header and the request timeout.
    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(REPLICATION_HEADER, self.credential.token())
            .timeout(self.request_timeout)
    }

    async fn send(&self, node: &ClusterNode, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| unreachable(node, e))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(unreachable(node, format!("HTTP {}: {}", status, body)))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        node: &ClusterNode,
        builder: RequestBuilder,
    ) -> Result<T> {
        self.send(node, builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| unreachable(node, format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn probe(&self, node: &ClusterNode) -> Result<PeerHealth> {
        let url = endpoint(node, "/health");
        debug!(node = %node.id, url = %url, "Probing peer");
        let builder = self.client.get(url).timeout(self.probe_timeout);
        self.send_json(node, builder).await
    }

    async fn replicate(&self, node: &ClusterNode, request: &ReplicateRequest) -> Result<()> {
        let builder = self
            .authorized(self.client.post(endpoint(node, "/cache/replicate")))
            .json(request);
        self.send(node, builder).await.map(|_| ())
    }

    async fn mget(
        &self,
        node: &ClusterNode,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Value>>> {
        let request = MgetRequest {
            keys: keys.to_vec(),
        };
        let builder = self
            .authorized(self.client.post(endpoint(node, "/cache/mget")))
            .json(&request);
        let response: MgetResponse = self.send_json(node, builder).await?;
        Ok(response.values)
    }

    async fn mset(&self, node: &ClusterNode, request: &MsetRequest) -> Result<usize> {
        let builder = self
            .authorized(self.client.post(endpoint(node, "/cache/mset")))
            .json(request);
        let response: MsetResponse = self.send_json(node, builder).await?;
        Ok(response.stored)
    }

    async fn clear(&self, node: &ClusterNode, pattern: &str) -> Result<usize> {
        let builder = self
            .authorized(self.client.delete(endpoint(node, "/cache/clear")))
            .query(&[("pattern", pattern)]);
        let response: ClearResponse = self.send_json(node, builder).await?;
        Ok(response.cleared)
    }
}
