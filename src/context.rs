//! Application Context
//!
//! Everything a request handler needs, built once at startup and passed to
//! the router as state. Components start in dependency order (backend,
//! cache manager, cleanup scheduler, cluster manager) and stop in reverse.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::cache::{open_backend, CacheBackend, CacheManager};
use crate::cluster::{ClusterManager, LoadSampler};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::tasks::CleanupScheduler;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheManager>,
    pub scheduler: Arc<CleanupScheduler>,
    /// Present only when clustering is enabled
    pub cluster: Option<Arc<ClusterManager>>,
    pub load: Arc<LoadSampler>,
    pub started_at: Instant,
}

impl AppState {
    /// Opens the configured backend and starts every background task.
    ///
    /// A backend that cannot be reached here is fatal.
    pub async fn initialize(config: Config) -> Result<Self> {
        let backend = open_backend(&config).await?;
        let load = Arc::new(LoadSampler::new());
        let cluster = if config.cluster.enabled {
            Some(ClusterManager::from_config(&config, load.clone())?)
        } else {
            None
        };

        let state = Self::assemble(config, backend, cluster, load);
        state.scheduler.start();
        if let Some(cluster) = &state.cluster {
            cluster.start();
        }

        info!(
            node_id = %state.config.node_id,
            backend = %state.cache.backend_kind(),
            clustered = state.cluster.is_some(),
            "Application context initialized"
        );
        Ok(state)
    }

    /// Wires already-built components together without starting any
    /// background task.
    pub fn assemble(
        config: Config,
        backend: Arc<dyn CacheBackend>,
        cluster: Option<Arc<ClusterManager>>,
        load: Arc<LoadSampler>,
    ) -> Self {
        let cache = Arc::new(CacheManager::new(backend));
        let scheduler = CleanupScheduler::new(
            cache.clone(),
            config.cleanup_interval(),
            config.cleanup_retry_delay(),
        );
        if let Some(cluster) = &cluster {
            cache.attach_ownership(cluster.clone());
        }

        Self {
            config: Arc::new(config),
            cache,
            scheduler,
            cluster,
            load,
            started_at: Instant::now(),
        }
    }

    /// Cluster manager, or `ClusteringDisabled` on a single node.
    pub fn cluster(&self) -> Result<&Arc<ClusterManager>> {
        self.cluster.as_ref().ok_or(CacheError::ClusteringDisabled)
    }

    /// Stops the components in reverse start order.
    pub async fn shutdown(&self) {
        if let Some(cluster) = &self.cluster {
            cluster.shutdown().await;
        }
        self.scheduler.stop().await;
        self.cache.shutdown().await;
        info!("Application context shut down");
    }
}
