//! API Routes
//!
//! Configures the Axum router with all cache server endpoints.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::cluster::{
    distribution_handler, info_handler, join_handler, leave_handler, node_health_handler,
    rebalance_handler,
};
use super::handlers::{
    cleanup_handler, clear_handler, delete_handler, exists_handler, export_handler,
    flush_handler, get_handler, health_handler, invalidate_tags_handler, keys_handler,
    live_handler, mget_handler, monitor_keys_handler, mset_handler, ready_handler,
    replicate_handler, set_handler, stats_handler,
};
use crate::context::AppState;

/// Creates the main router with all endpoints configured.
///
/// Static `/cache/...` routes take precedence over `/cache/:key`, so
/// `keys`, `clear`, `mget`, `mset` and `replicate` are not usable as keys
/// through the path-based endpoints.
///
/// # Middleware
/// - CORS: Allows any origin
/// - Tracing: Logs all requests
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        // Cache
        .route("/cache/keys", get(keys_handler))
        .route("/cache/clear", delete(clear_handler))
        .route("/cache/mget", post(mget_handler))
        .route("/cache/mset", post(mset_handler))
        .route("/cache/replicate", post(replicate_handler))
        .route("/cache/invalidate/tags", post(invalidate_tags_handler))
        .route(
            "/cache/:key",
            get(get_handler).put(set_handler).delete(delete_handler),
        )
        .route("/cache/:key/exists", get(exists_handler))
        // Stats and admin
        .route("/stats", get(stats_handler))
        .route("/admin/cleanup", post(cleanup_handler))
        .route("/admin/flush", post(flush_handler))
        .route("/admin/export", get(export_handler))
        .route("/admin/monitor/keys", get(monitor_keys_handler))
        // Cluster
        .route("/cluster/info", get(info_handler))
        .route("/cluster/distribution", get(distribution_handler))
        .route("/cluster/nodes/join", post(join_handler))
        .route("/cluster/nodes/leave", post(leave_handler))
        .route("/cluster/nodes/:id/health", get(node_health_handler))
        .route("/cluster/rebalance", post(rebalance_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
