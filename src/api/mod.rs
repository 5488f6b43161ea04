//! API Module
//!
//! HTTP handlers and routing for the cache server REST API.
//!
//! # Endpoints
//! - `/health`, `/health/live`, `/health/ready` - Liveness, readiness and peer probe
//! - `/cache/...` - Key operations, batches, tags and the peer protocol
//! - `/stats`, `/admin/...` - Metrics and maintenance
//! - `/cluster/...` - Membership and ring introspection

pub mod cluster;
pub mod handlers;
pub mod routes;

pub use routes::create_router;
