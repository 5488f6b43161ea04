//! API Handlers
//!
//! HTTP request handlers for the cache, health, stats and admin endpoints.
//! Handlers are thin: validation, routing decisions, then one call into the
//! cache manager or the cluster manager.

use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{KeyPattern, MATCH_ALL, MAX_KEYS_LIMIT};
use crate::cluster::REPLICATION_HEADER;
use crate::context::AppState;
use crate::error::{CacheError, Result};
use crate::models::{
    validate_path_key, ClearQuery, ClearResponse, ComponentCheck, DeleteResponse, ExistsResponse,
    ExportFormat, ExportQuery, ExportResponse, FlushResponse, GetResponse, HealthResponse,
    InvalidateResponse, InvalidateTagsRequest, KeyInfo, KeysQuery, KeysResponse, MgetRequest,
    MgetResponse, MonitorKeysQuery, MonitorKeysResponse, MsetRequest, MsetResponse,
    ProbeResponse, ReplicateRequest, ReplicateResponse, SetRequest, SetResponse, StatsResponse,
};
use crate::tasks::CleanupReport;

const READINESS_TTL_SECS: u64 = 10;

fn check_key(key: &str) -> Result<()> {
    match validate_path_key(key) {
        Some(msg) => Err(CacheError::InvalidRequest(msg)),
        None => Ok(()),
    }
}

/// True when the request carries a valid inter-node credential. Such
/// requests are always served locally.
fn is_peer_request(state: &AppState, headers: &HeaderMap) -> bool {
    let token = headers
        .get(REPLICATION_HEADER)
        .and_then(|v| v.to_str().ok());
    state
        .cluster
        .as_ref()
        .map_or(false, |cluster| cluster.verify_peer(token))
}

/// `307` to `key` on the node at `base`. The key is encoded as a single
/// path segment; `None` when no Location can be built for it.
fn owner_redirect(base: &str, key: &str) -> Option<Response> {
    if key == "." || key == ".." {
        return None;
    }
    let mut url = Url::parse(base).ok()?;
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .push("cache")
        .push(key);
    let location = HeaderValue::try_from(url.as_str()).ok()?;
    Some((StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response())
}

// == Cache ==

/// Handler for GET /cache/:key
///
/// Redirects to the owning node when another online node owns the key.
/// Falls back to a local read when no redirect can be built.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    check_key(&key)?;

    if !state.cache.owns(&key) && !is_peer_request(&state, &headers) {
        if let Some(url) = state.cluster.as_ref().and_then(|c| c.route(&key)) {
            match owner_redirect(&url, &key) {
                Some(redirect) => {
                    debug!(key = %key, owner = %url, "Redirecting to owner");
                    return Ok(redirect);
                }
                None => warn!(key = %key, owner = %url, "Cannot redirect, serving locally"),
            }
        }
    }

    match state.cache.get(&key).await {
        Some(value) => Ok(Json(GetResponse::new(key, value)).into_response()),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for PUT /cache/:key
///
/// Writes locally, then pushes the write to the key's replicas.
pub async fn set_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    check_key(&key)?;
    let ttl = req.ttl();

    let local_written = match state
        .cache
        .try_set(&key, req.value.clone(), ttl, req.tags.clone())
        .await
    {
        Ok(()) => true,
        Err(err @ CacheError::ItemTooLarge { .. }) => return Err(err),
        Err(err) if state.cluster.is_none() => return Err(err),
        Err(err) => {
            warn!(key = %key, error = %err, "Local write failed, relying on replicas");
            false
        }
    };

    let cluster = match &state.cluster {
        Some(cluster) if !is_peer_request(&state, &headers) => cluster,
        _ => return Ok(Json(SetResponse::new(key, None))),
    };
    if !state.cache.owns(&key) {
        debug!(key = %key, "Writing key owned by another node");
    }

    let outcome = cluster
        .replicate(
            ReplicateRequest {
                key: key.clone(),
                value: req.value,
                ttl: req.ttl,
                tags: req.tags,
            },
            local_written,
        )
        .await;

    if !outcome.satisfied {
        return Err(CacheError::PeerUnreachable {
            node: outcome.failed.join(","),
            reason: format!(
                "{} of {} required acknowledgements",
                outcome.acks, outcome.required
            ),
        });
    }
    Ok(Json(SetResponse::new(key, Some(outcome))))
}

/// Handler for DELETE /cache/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    check_key(&key)?;
    if state.cache.delete(&key).await {
        Ok(Json(DeleteResponse::new(key)))
    } else {
        Err(CacheError::NotFound(key))
    }
}

/// Handler for GET /cache/:key/exists
pub async fn exists_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ExistsResponse>> {
    check_key(&key)?;
    let exists = state.cache.exists(&key).await;
    Ok(Json(ExistsResponse { key, exists }))
}

/// Handler for POST /cache/mget
///
/// When clustered, keys are grouped by owner and fetched in parallel. Keys
/// whose owner is unreachable are read locally.
pub async fn mget_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MgetRequest>,
) -> Result<Json<MgetResponse>> {
    if let Some(msg) = req.validate() {
        return Err(CacheError::InvalidRequest(msg));
    }

    let cluster = match &state.cluster {
        Some(cluster) if !is_peer_request(&state, &headers) => cluster,
        _ => {
            let values = state.cache.mget(&req.keys).await;
            return Ok(Json(MgetResponse::new(values)));
        }
    };

    let partition = cluster.partition(req.keys.into_iter().map(|k| (k, ())));
    let remote: HashMap<String, Vec<String>> = partition
        .remote
        .into_iter()
        .map(|(node, keys)| (node, keys.into_iter().map(|(k, _)| k).collect()))
        .collect();

    let (mut values, unreachable) = cluster.mget_remote(remote).await;
    let mut local: Vec<String> = partition.local.into_iter().map(|(k, _)| k).collect();
    local.extend(unreachable);
    if !local.is_empty() {
        values.extend(state.cache.mget(&local).await);
    }
    Ok(Json(MgetResponse::new(values)))
}

/// Handler for POST /cache/mset
pub async fn mset_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MsetRequest>,
) -> Result<Json<MsetResponse>> {
    if let Some(msg) = req.validate() {
        return Err(CacheError::InvalidRequest(msg));
    }
    let ttl = req.ttl();

    let cluster = match &state.cluster {
        Some(cluster) if !is_peer_request(&state, &headers) => cluster,
        _ => {
            let stored = req.items.len();
            let success = state.cache.mset(req.items, ttl, req.tags).await;
            return Ok(Json(MsetResponse {
                success,
                stored: if success { stored } else { 0 },
            }));
        }
    };

    let partition = cluster.partition(req.items);
    let (remote_stored, unsent) = cluster
        .mset_remote(partition.remote, req.ttl, &req.tags)
        .await;

    let local: HashMap<String, Value> = partition.local.into_iter().chain(unsent).collect();
    let (success, local_stored) = if local.is_empty() {
        (true, 0)
    } else {
        let count = local.len();
        let tags = req
            .tags
            .into_iter()
            .filter(|(key, _)| local.contains_key(key))
            .collect();
        let ok = state.cache.mset(local, ttl, tags).await;
        (ok, if ok { count } else { 0 })
    };

    Ok(Json(MsetResponse {
        success,
        stored: remote_stored + local_stored,
    }))
}

/// Handler for GET /cache/keys
pub async fn keys_handler(
    State(state): State<AppState>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<KeysResponse>> {
    let pattern = KeyPattern::new(&query.pattern)?;
    let limit = query.limit.clamp(1, MAX_KEYS_LIMIT);
    let keys = state.cache.keys(pattern.as_str()).await;
    Ok(Json(KeysResponse::new(query.pattern, keys, limit)))
}

/// Handler for DELETE /cache/clear
///
/// Fans out to every online peer unless the request came from one.
pub async fn clear_handler(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
    headers: HeaderMap,
) -> Result<Json<ClearResponse>> {
    let pattern = KeyPattern::new(&query.pattern)?;
    let cleared = state.cache.clear(pattern.as_str()).await;

    let peers_cleared = match &state.cluster {
        Some(cluster) if !is_peer_request(&state, &headers) => {
            cluster.clear_peers(pattern.as_str()).await
        }
        _ => 0,
    };

    Ok(Json(ClearResponse {
        pattern: query.pattern,
        cleared,
        peers_cleared,
    }))
}

/// Handler for POST /cache/invalidate/tags
pub async fn invalidate_tags_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateTagsRequest>,
) -> Result<Json<InvalidateResponse>> {
    if req.tags.is_empty() {
        return Err(CacheError::InvalidRequest("tags cannot be empty".into()));
    }
    let invalidated = state.cache.invalidate_by_tags(&req.tags).await;
    Ok(Json(InvalidateResponse {
        tags: req.tags,
        invalidated,
    }))
}

/// Handler for POST /cache/replicate
///
/// Peer protocol only: rejected without a valid credential.
pub async fn replicate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReplicateRequest>,
) -> Result<Json<ReplicateResponse>> {
    if !is_peer_request(&state, &headers) {
        warn!(key = %req.key, "Replication request rejected");
        return Err(CacheError::InvalidReplicationCredential);
    }
    if let Some(msg) = req.validate() {
        return Err(CacheError::InvalidRequest(msg));
    }

    let ttl = req.ttl();
    state.cache.try_set(&req.key, req.value, ttl, req.tags).await?;
    debug!(key = %req.key, "Accepted replicated write");
    Ok(Json(ReplicateResponse {
        success: true,
        key: req.key,
    }))
}

// == Health ==

/// Handler for GET /health
///
/// Also the endpoint peers probe. Answers 503 when the backend is down.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut checks = BTreeMap::new();

    checks.insert(
        "backend",
        match state.cache.backend_stats().await {
            Ok(_) => ComponentCheck::ok(),
            Err(e) => ComponentCheck::failed(e.to_string()),
        },
    );

    let scheduler = state.scheduler.stats();
    checks.insert(
        "scheduler",
        if scheduler.running {
            ComponentCheck::ok()
        } else {
            ComponentCheck::failed("cleanup scheduler not running")
        },
    );

    if let Some(cluster) = &state.cluster {
        let info = cluster.cluster_info();
        let check = if info.online_nodes == info.nodes.len() {
            ComponentCheck::ok()
        } else {
            ComponentCheck::failed(format!(
                "{} of {} nodes online",
                info.online_nodes,
                info.nodes.len()
            ))
        };
        checks.insert("cluster", check);
    }

    let response = HealthResponse::from_checks(
        state.config.node_id.clone(),
        state.config.version.clone(),
        state.started_at.elapsed().as_secs_f64(),
        state.load.sample(),
        checks,
    );
    let status = if response.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}

/// Handler for GET /health/live
pub async fn live_handler() -> Json<ProbeResponse> {
    Json(ProbeResponse::new("alive"))
}

/// Handler for GET /health/ready
///
/// Round-trips a short-lived key through the backend.
pub async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let key = format!("readiness_check:{}", state.config.node_id);
    let probe = Value::from(chrono::Utc::now().timestamp_millis());
    let ttl = Some(std::time::Duration::from_secs(READINESS_TTL_SECS));

    let ready = state
        .cache
        .try_set(&key, probe.clone(), ttl, Vec::new())
        .await
        .is_ok()
        && state.cache.get(&key).await.as_ref() == Some(&probe);

    if ready {
        (StatusCode::OK, Json(ProbeResponse::new("ready")))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse::new("not_ready")),
        )
    }
}

// == Stats / Admin ==

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_id: state.config.node_id.clone(),
        cache: state.cache.stats().await,
        scheduler: state.scheduler.stats(),
        cluster: state.cluster.as_ref().map(|c| c.cluster_info()),
    })
}

/// Handler for POST /admin/cleanup
pub async fn cleanup_handler(State(state): State<AppState>) -> Result<Json<CleanupReport>> {
    Ok(Json(state.scheduler.run_cycle().await?))
}

/// Handler for POST /admin/flush
pub async fn flush_handler(State(state): State<AppState>) -> Json<FlushResponse> {
    let cleared = state.cache.clear(MATCH_ALL).await;
    Json(FlushResponse::new(cleared))
}

/// Handler for GET /admin/export
///
/// Dumps up to `limit` live entries of this node, in key order, as JSON or
/// as a MessagePack attachment.
pub async fn export_handler(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let limit = query.limit.clamp(1, MAX_KEYS_LIMIT);
    let mut keys = state.cache.keys(MATCH_ALL).await;
    keys.sort();
    if keys.len() > limit {
        warn!(total = keys.len(), limit, "Export limited");
        keys.truncate(limit);
    }

    let total_keys = keys.len();
    let data: BTreeMap<String, Value> = state
        .cache
        .mget(&keys)
        .await
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect();

    match query.format {
        ExportFormat::Json => Ok(Json(ExportResponse::new(
            state.config.node_id.clone(),
            total_keys,
            data,
        ))
        .into_response()),
        ExportFormat::Msgpack => {
            let body = rmp_serde::to_vec_named(&data)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
            let disposition = format!(
                "attachment; filename=cache_export_{}.msgpack",
                chrono::Utc::now().timestamp()
            );
            Ok((
                [
                    (header::CONTENT_TYPE, "application/msgpack".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                body,
            )
                .into_response())
        }
    }
}

/// Handler for GET /admin/monitor/keys
pub async fn monitor_keys_handler(
    State(state): State<AppState>,
    Query(query): Query<MonitorKeysQuery>,
) -> Json<MonitorKeysResponse> {
    let keys = state.cache.keys(MATCH_ALL).await;
    let rows = state
        .cache
        .mget(&keys)
        .await
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value?;
            let size_bytes = serde_json::to_vec(&value).map_or(0, |bytes| bytes.len());
            Some(KeyInfo { key, size_bytes })
        })
        .collect();

    Json(MonitorKeysResponse::paginate(
        state.config.node_id.clone(),
        rows,
        query.sort_by,
        query.order,
        query.limit.clamp(1, MAX_KEYS_LIMIT),
        query.offset,
    ))
}
