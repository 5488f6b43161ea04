//! TechStats Cache - distributed cache tier
//!
//! Pluggable storage backends (in-process memory, Redis, SQLite document
//! store) behind one façade, with size-bounded eviction, tag invalidation,
//! periodic cleanup and consistent-hash clustering.

pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod tasks;

pub use api::create_router;
pub use config::Config;
pub use context::AppState;
pub use error::{CacheError, Result};
