//! Cluster Handlers
//!
//! Introspection and administration of cluster membership. Every handler
//! answers 400 when clustering is disabled.

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::cluster::{ClusterInfo, ClusterNode};
use crate::context::AppState;
use crate::error::{CacheError, Result};
use crate::models::{
    DistributionQuery, DistributionResponse, JoinRequest, KeyPlacement, LeaveRequest,
    MembershipResponse,
};

/// Handler for GET /cluster/info
pub async fn info_handler(State(state): State<AppState>) -> Result<Json<ClusterInfo>> {
    Ok(Json(state.cluster()?.cluster_info()))
}

/// Handler for GET /cluster/distribution
///
/// With `?key=` also reports that key's owner and replica set.
pub async fn distribution_handler(
    State(state): State<AppState>,
    Query(query): Query<DistributionQuery>,
) -> Result<Json<DistributionResponse>> {
    let cluster = state.cluster()?;
    let key = query.key.map(|key| KeyPlacement {
        owner: cluster.owner_of(&key),
        replicas: cluster.replica_set(&key, cluster.replication_factor()),
        key,
    });

    Ok(Json(DistributionResponse {
        ring_size: cluster.ring_size(),
        nodes: cluster.distribution(),
        key,
    }))
}

/// Handler for POST /cluster/nodes/join
pub async fn join_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<MembershipResponse>> {
    let cluster = state.cluster()?;
    if let Some(msg) = req.validate() {
        return Err(CacheError::InvalidRequest(msg));
    }

    let node_id = req.id.clone();
    let distribution = cluster.join(req.id, req.url, req.version, req.metadata)?;
    Ok(Json(MembershipResponse {
        message: format!("Node '{}' joining cluster", node_id),
        node_id,
        distribution,
    }))
}

/// Handler for POST /cluster/nodes/leave
pub async fn leave_handler(
    State(state): State<AppState>,
    Json(req): Json<LeaveRequest>,
) -> Result<Json<MembershipResponse>> {
    let distribution = state.cluster()?.leave(&req.id)?;
    Ok(Json(MembershipResponse {
        message: format!("Node '{}' removed from cluster", req.id),
        node_id: req.id,
        distribution,
    }))
}

/// Handler for GET /cluster/nodes/:id/health
pub async fn node_health_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClusterNode>> {
    let node = state.cluster()?.node_health(&id).await?;
    Ok(Json(node))
}

/// Handler for POST /cluster/rebalance
pub async fn rebalance_handler(
    State(state): State<AppState>,
) -> Result<Json<DistributionResponse>> {
    let cluster = state.cluster()?;
    let nodes = cluster.rebalance();
    Ok(Json(DistributionResponse {
        ring_size: cluster.ring_size(),
        nodes,
        key: None,
    }))
}
