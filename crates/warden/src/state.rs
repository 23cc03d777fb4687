//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;

use warden::auth::{AuthenticationSessionCache, InMemoryUserDirectory, LoggingListener, LogoutNotifier};
use warden::cluster::{ClusterCacheManager, JoinStatus};
use warden::config::AppConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Cluster membership and caches
    pub manager: Arc<ClusterCacheManager>,

    /// Authentication sessions
    pub sessions: Arc<AuthenticationSessionCache>,

    /// Login/logout fan-out
    pub notifier: Arc<LogoutNotifier>,

    /// Outcome of the cluster join
    pub join_status: JoinStatus,

    pub started_at: Instant,
}

impl AppState {
    /// Join the cluster and open the session cache
    pub async fn new(config: AppConfig) -> Result<Self> {
        let directory = Arc::new(InMemoryUserDirectory::from_seeds(&config.users));
        tracing::info!(users = directory.len(), "User directory loaded");

        let notifier = Arc::new(LogoutNotifier::new(directory));
        notifier.register(Arc::new(LoggingListener));

        let manager = Arc::new(ClusterCacheManager::new(
            config.cluster.clone(),
            config.cache.clone(),
        ));
        let join_status = manager
            .start()
            .await
            .context("Failed to start cluster cache manager")?;

        let sessions = AuthenticationSessionCache::new(
            &manager,
            Arc::clone(&notifier),
            config.cache.session_ttl(),
        )
        .await
        .context("Failed to open session cache")?;

        Ok(Self {
            config,
            manager,
            sessions: Arc::new(sessions),
            notifier,
            join_status,
            started_at: Instant::now(),
        })
    }
}
