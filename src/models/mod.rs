//! Request and Response models for the cache server API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies, including
//! the node-to-node peer protocol.

pub mod requests;
pub mod responses;

pub use requests::{
    validate_path_key, ClearQuery, DistributionQuery, ExportFormat, ExportQuery,
    InvalidateTagsRequest, JoinRequest, KeysQuery, LeaveRequest, MgetRequest, MonitorKeysQuery,
    MsetRequest, ReplicateRequest, SetRequest, SortField, SortOrder,
};
pub use responses::{
    ClearResponse, ComponentCheck, DeleteResponse, DistributionResponse, ExistsResponse,
    ExportResponse, FlushResponse, GetResponse, HealthResponse, InvalidateResponse, KeyInfo,
    KeyPlacement, KeysResponse, MembershipResponse, MgetResponse, MonitorKeysResponse,
    MsetResponse, ProbeResponse, ReplicateResponse, SetResponse, StatsResponse,
};
