//! Error types for the cache tier
//!
//! Provides unified error handling using thiserror. Backend failures are
//! caught at the `CacheManager` boundary; the HTTP layer only sees the
//! variants that make sense to a client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache tier.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Backend connection or initialization failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Value could not be encoded or decoded
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// Item exceeds the per-item size budget
    #[error("Item too large: key '{key}' is {size} bytes, limit is {max} bytes")]
    ItemTooLarge { key: String, size: usize, max: usize },

    /// Peer did not answer within its timeout
    #[error("Peer unreachable: {node}: {reason}")]
    PeerUnreachable { node: String, reason: String },

    /// Peer protocol request without a valid inter-node credential
    #[error("Invalid replication credential")]
    InvalidReplicationCredential,

    /// Cluster endpoint called on a single-node deployment
    #[error("Clustering is not enabled")]
    ClusteringDisabled,

    /// Join request for an id that is already a member
    #[error("Node already in cluster: {0}")]
    NodeAlreadyExists(String),

    /// Node id not present in the node table
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == Driver Conversions ==
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::BackendUnavailable(format!("redis: {}", err))
    }
}

impl From<tokio_rusqlite::Error> for CacheError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        CacheError::BackendUnavailable(format!("sqlite: {}", err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) | CacheError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_)
            | CacheError::ClusteringDisabled
            | CacheError::NodeAlreadyExists(_) => StatusCode::BAD_REQUEST,
            CacheError::ItemTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CacheError::InvalidReplicationCredential => StatusCode::FORBIDDEN,
            CacheError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
            CacheError::Serialization(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache tier.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CacheError::NotFound("k".into()), StatusCode::NOT_FOUND),
            (CacheError::ClusteringDisabled, StatusCode::BAD_REQUEST),
            (CacheError::InvalidReplicationCredential, StatusCode::FORBIDDEN),
            (
                CacheError::ItemTooLarge {
                    key: "k".into(),
                    size: 10,
                    max: 5,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                CacheError::BackendUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_item_too_large_message() {
        let err = CacheError::ItemTooLarge {
            key: "big".into(),
            size: 2048,
            max: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("big"));
        assert!(msg.contains("2048"));
    }
}
