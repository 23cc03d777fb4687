//! Cache manager: owns the cluster transport and the named caches on it.
//!
//! The manager is constructed explicitly and passed to whatever needs a
//! cache. `start` joins the cluster, `shutdown` leaves it; both are
//! idempotent.

use serde::Serialize;
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use warden_common::{ClusterNode, Result, WardenError};

use super::transport::ClusterTransport;
use super::wire::MemberInfo;
use crate::cache::{CacheKey, CacheValue, ManagedCache, ReplicatedCache};
use crate::config::{CacheConfig, ClusterConfig};

/// Outcome of joining the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinStatus {
    /// The initial cluster size was reached
    Formed { members: usize },
    /// Join timed out; running with whoever was found (possibly alone)
    Degraded { members: usize, expected: usize },
}

struct CacheSlot {
    cache: Arc<dyn Any + Send + Sync>,
    lifecycle: Arc<dyn ManagedCache>,
    types: &'static str,
}

struct Running {
    transport: Arc<ClusterTransport>,
    status: JoinStatus,
    caches: HashMap<String, CacheSlot>,
}

enum State {
    Idle,
    /// `start` is waiting for the cluster to form
    Joining,
    Running(Running),
    Stopped,
}

/// Owner of cluster membership and of every replicated cache on this node
pub struct ClusterCacheManager {
    cluster: ClusterConfig,
    cache: CacheConfig,
    state: Mutex<State>,
    /// Serializes `start`; never held together with a wait on `state`
    start_lock: Mutex<()>,
}

impl ClusterCacheManager {
    pub fn new(cluster: ClusterConfig, cache: CacheConfig) -> Self {
        Self {
            cluster,
            cache,
            state: Mutex::new(State::Idle),
            start_lock: Mutex::new(()),
        }
    }

    /// Join the cluster.
    ///
    /// Waits up to `join_timeout` for `initial_cluster_size` members (self
    /// included), then proceeds either way. Only a transport that cannot
    /// initialize is an error.
    ///
    /// Other manager calls are not blocked while the join is pending; they
    /// see the manager as not yet started.
    pub async fn start(&self) -> Result<JoinStatus> {
        let _starting = self.start_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            match &*state {
                State::Running(running) => return Ok(running.status),
                State::Stopped => return Err(WardenError::ShutDown),
                State::Idle | State::Joining => {}
            }

            if self.cluster.initial_cluster_size == 0 {
                return Err(WardenError::Config(
                    "initial_cluster_size must be at least 1".to_string(),
                ));
            }
            *state = State::Joining;
        }

        match self.join().await {
            Ok((transport, status)) => {
                let mut state = self.state.lock().await;
                if matches!(*state, State::Stopped) {
                    drop(state);
                    transport.shutdown().await;
                    return Err(WardenError::ShutDown);
                }
                *state = State::Running(Running {
                    transport,
                    status,
                    caches: HashMap::new(),
                });
                Ok(status)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if matches!(*state, State::Joining) {
                    *state = State::Idle;
                }
                Err(e)
            }
        }
    }

    /// Bind the transport and wait for the initial cluster size
    async fn join(&self) -> Result<(Arc<ClusterTransport>, JoinStatus)> {
        let expected = self.cluster.initial_cluster_size;
        let transport = ClusterTransport::bind(&self.cluster).await?;
        transport.spawn();

        tracing::info!(
            node = %self.cluster.node_name,
            cluster = %self.cluster.cluster_name,
            addr = %transport.local_addr(),
            seeds = ?self.cluster.seeds,
            expected,
            "Joining cluster"
        );

        let mut count = transport.member_count();
        let formed = tokio::time::timeout(
            self.cluster.join_timeout(),
            count.wait_for(|n| *n >= expected),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        let members = *count.borrow();

        let status = if formed {
            tracing::info!(members, "Cluster formed");
            JoinStatus::Formed { members }
        } else {
            tracing::warn!(
                members,
                expected,
                timeout_secs = self.cluster.join_timeout_secs,
                "Cluster join timed out, continuing in degraded mode"
            );
            JoinStatus::Degraded { members, expected }
        };
        Ok((transport, status))
    }

    /// Get the named cache, creating it on first use.
    ///
    /// A name is bound to one key/value type pair for the manager's life.
    pub async fn get_or_create_cache<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
    ) -> Result<Arc<ReplicatedCache<K, V>>> {
        let mut state = self.state.lock().await;
        let running = match &mut *state {
            State::Running(running) => running,
            State::Idle | State::Joining => return Err(WardenError::NotStarted),
            State::Stopped => return Err(WardenError::ShutDown),
        };

        if let Some(slot) = running.caches.get(name) {
            return Arc::clone(&slot.cache)
                .downcast::<ReplicatedCache<K, V>>()
                .map_err(|_| {
                    WardenError::CacheTypeMismatch(format!(
                        "cache {name:?} holds {}, requested {}",
                        slot.types,
                        type_name::<(K, V)>()
                    ))
                });
        }

        let cache = ReplicatedCache::<K, V>::create(
            name,
            Arc::clone(&running.transport),
            self.cache.clone(),
        )
        .await?;
        running.caches.insert(
            name.to_string(),
            CacheSlot {
                cache: Arc::clone(&cache) as Arc<dyn Any + Send + Sync>,
                lifecycle: Arc::clone(&cache) as Arc<dyn ManagedCache>,
                types: type_name::<(K, V)>(),
            },
        );
        Ok(cache)
    }

    /// Stop every cache and leave the cluster
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, State::Stopped) {
            State::Running(running) => running,
            State::Idle => {
                *state = State::Idle;
                return;
            }
            // The pending `start` sees this and leaves the cluster itself
            State::Joining => return,
            State::Stopped => return,
        };

        for slot in running.caches.values() {
            slot.lifecycle.stop();
        }
        running.transport.shutdown().await;
        tracing::info!(node = %self.cluster.node_name, caches = running.caches.len(), "Cache manager shut down");
    }

    pub fn node(&self) -> ClusterNode {
        self.cluster.node()
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, State::Running(_))
    }

    pub async fn status(&self) -> Option<JoinStatus> {
        match &*self.state.lock().await {
            State::Running(running) => Some(running.status),
            _ => None,
        }
    }

    /// Bound transport address, once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Running(running) => Some(running.transport.local_addr()),
            _ => None,
        }
    }

    /// Live members other than this node, sorted by name
    pub async fn members(&self) -> Vec<MemberInfo> {
        let transport = match &*self.state.lock().await {
            State::Running(running) => Arc::clone(&running.transport),
            _ => return Vec::new(),
        };
        transport.members().await
    }

    /// True when running without any live peer
    pub async fn is_standalone(&self) -> bool {
        match &*self.state.lock().await {
            State::Running(running) => {
                let members = *running.transport.member_count().borrow();
                members <= 1
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cluster_config(name: &str) -> ClusterConfig {
        ClusterConfig {
            cluster_name: "manager-test".to_string(),
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_ms: 50,
            member_timeout_ms: 3_000,
            retransmit_interval_ms: 50,
            join_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn manager(name: &str) -> ClusterCacheManager {
        ClusterCacheManager::new(cluster_config(name), CacheConfig::default())
    }

    #[tokio::test]
    async fn single_node_forms_immediately() {
        let manager = manager("node-a");
        let status = manager.start().await.unwrap();
        assert_eq!(status, JoinStatus::Formed { members: 1 });
        assert!(manager.is_standalone().await);

        // Starting again reports the same status
        assert_eq!(manager.start().await.unwrap(), status);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn join_timeout_degrades() {
        let mut config = cluster_config("node-a");
        config.initial_cluster_size = 2;
        let manager = ClusterCacheManager::new(config, CacheConfig::default());

        let status = manager.start().await.unwrap();
        assert_eq!(status, JoinStatus::Degraded { members: 1, expected: 2 });
        assert!(manager.is_running().await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_bootstrap_error() {
        let first = manager("node-a");
        first.start().await.unwrap();
        let taken = first.local_addr().await.unwrap();

        let mut config = cluster_config("node-b");
        config.bind_addr = taken.to_string();
        let second = ClusterCacheManager::new(config, CacheConfig::default());
        assert!(matches!(
            second.start().await,
            Err(WardenError::ClusterBootstrap(_))
        ));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let never_started = manager("node-a");
        never_started.shutdown().await;
        never_started.shutdown().await;
        assert!(!never_started.is_running().await);

        let manager = manager("node-b");
        manager.start().await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(!manager.is_running().await);
        assert!(matches!(manager.start().await, Err(WardenError::ShutDown)));
    }

    #[tokio::test]
    async fn caches_require_start() {
        let manager = manager("node-a");
        let result = manager.get_or_create_cache::<u64, String>("sessions").await;
        assert!(matches!(result, Err(WardenError::NotStarted)));
    }

    #[tokio::test]
    async fn cache_names_are_typed() {
        let manager = manager("node-a");
        manager.start().await.unwrap();

        let first = manager
            .get_or_create_cache::<u64, String>("sessions")
            .await
            .unwrap();
        let again = manager
            .get_or_create_cache::<u64, String>("sessions")
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let mismatch = manager.get_or_create_cache::<String, u64>("sessions").await;
        assert!(matches!(mismatch, Err(WardenError::CacheTypeMismatch(_))));
        manager.shutdown().await;

        assert!(matches!(
            first.get(&1).await,
            Err(WardenError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn two_nodes_form_a_cluster() {
        let a = manager("node-a");
        a.start().await.unwrap();
        let seed = a.local_addr().await.unwrap();

        let mut config = cluster_config("node-b");
        config.seeds = vec![seed.to_string()];
        config.initial_cluster_size = 2;
        config.join_timeout_secs = 5;
        let b = ClusterCacheManager::new(config, CacheConfig::default());

        let status = b.start().await.unwrap();
        assert_eq!(status, JoinStatus::Formed { members: 2 });
        assert!(!b.is_standalone().await);
        let members = b.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].node.node_name, "node-a");

        b.shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.members().await.is_empty());
        a.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_join_does_not_block_other_calls() {
        let mut config = cluster_config("node-a");
        config.initial_cluster_size = 2;
        let manager = Arc::new(ClusterCacheManager::new(config, CacheConfig::default()));

        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.start().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let running = tokio::time::timeout(Duration::from_millis(100), manager.is_running()).await;
        assert_eq!(running, Ok(false));
        let status = tokio::time::timeout(Duration::from_millis(100), manager.status()).await;
        assert_eq!(status, Ok(None));
        assert!(matches!(
            manager.get_or_create_cache::<u64, String>("sessions").await,
            Err(WardenError::NotStarted)
        ));

        let status = starting.await.unwrap().unwrap();
        assert_eq!(status, JoinStatus::Degraded { members: 1, expected: 2 });
        assert!(manager.is_running().await);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_during_join_wins() {
        let mut config = cluster_config("node-a");
        config.initial_cluster_size = 2;
        let manager = Arc::new(ClusterCacheManager::new(config, CacheConfig::default()));

        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.start().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        assert!(matches!(starting.await.unwrap(), Err(WardenError::ShutDown)));
        assert!(!manager.is_running().await);
        assert!(matches!(manager.start().await, Err(WardenError::ShutDown)));
    }
}
