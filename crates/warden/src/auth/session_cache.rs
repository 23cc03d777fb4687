//! Authentication sessions on top of the replicated cache.
//!
//! Sessions are keyed by user id and expire after a configurable TTL. Any
//! removal of a session (expiry, invalidation, explicit removal), on any
//! node, ends in one logout notification per node.

use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use warden_common::constants::{cache_names, logout_properties};
use warden_common::{RemovalCause, Result, Session, UserId, WardenError};

use super::listener::Properties;
use super::notifier::LogoutNotifier;
use crate::cache::{CacheStats, RemovalEvent, RemovalListener, ReplicatedCache};
use crate::cluster::{ClusterCacheManager, Version};

/// Removals remembered for duplicate suppression
const RECENT_REMOVALS: usize = 4_096;

/// Bounded set of recently handled removals
struct RecentRemovals {
    order: VecDeque<(UserId, Version)>,
    seen: HashSet<(UserId, Version)>,
}

impl RecentRemovals {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if the removal was already handled
    fn insert(&mut self, user_id: UserId, version: &Version) -> bool {
        let id = (user_id, version.clone());
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_REMOVALS {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Turns session removals into logout notifications
struct LogoutDispatch {
    notifier: Arc<LogoutNotifier>,
    recent: Mutex<RecentRemovals>,
}

impl LogoutDispatch {
    fn properties(event: &RemovalEvent<UserId, Session>) -> Properties {
        let mut properties: Properties = event
            .value
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.insert(logout_properties::CAUSE.to_string(), event.cause.to_string());
        properties.insert(logout_properties::ORIGIN.to_string(), event.origin.clone());
        properties.insert(
            logout_properties::PRINCIPAL.to_string(),
            event.value.principal.clone(),
        );
        properties
    }
}

impl RemovalListener<UserId, Session> for LogoutDispatch {
    fn on_removal(&self, event: &RemovalEvent<UserId, Session>) {
        let first = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.key, &event.version);
        if !first {
            tracing::debug!(user_id = %event.key, version = %event.version, cause = %event.cause, "Duplicate session removal ignored");
            return;
        }

        match event.cause {
            RemovalCause::Expired => {
                tracing::info!(user_id = %event.key, origin = %event.origin, "Session expired")
            }
            RemovalCause::Invalidated | RemovalCause::ExplicitRemoval => {
                tracing::info!(user_id = %event.key, origin = %event.origin, cause = %event.cause, "Session removed")
            }
        }
        self.notifier.notify(event.key, &Self::properties(event));
    }
}

/// Cluster-wide cache of authentication sessions.
///
/// Create one per manager: each instance subscribes its own logout dispatch.
pub struct AuthenticationSessionCache {
    cache: Arc<ReplicatedCache<UserId, Session>>,
    notifier: Arc<LogoutNotifier>,
    ttl: RwLock<Duration>,
}

impl AuthenticationSessionCache {
    /// Open the session cache on a started manager
    pub async fn new(
        manager: &ClusterCacheManager,
        notifier: Arc<LogoutNotifier>,
        ttl: Duration,
    ) -> Result<Self> {
        let cache = manager
            .get_or_create_cache::<UserId, Session>(cache_names::AUTH_SESSIONS)
            .await?;
        Self::from_cache(cache, notifier, ttl)
    }

    /// Wrap an existing replicated cache
    pub fn from_cache(
        cache: Arc<ReplicatedCache<UserId, Session>>,
        notifier: Arc<LogoutNotifier>,
        ttl: Duration,
    ) -> Result<Self> {
        validate_ttl(ttl)?;
        cache.add_removal_listener(Arc::new(LogoutDispatch {
            notifier: Arc::clone(&notifier),
            recent: Mutex::new(RecentRemovals::new()),
        }));
        Ok(Self {
            cache,
            notifier,
            ttl: RwLock::new(ttl),
        })
    }

    pub async fn get(&self, user_id: UserId) -> Result<Option<Session>> {
        self.cache.get(&user_id).await
    }

    /// Store (or replace) the user's session with the current TTL
    pub async fn put(&self, user_id: UserId, session: Session) -> Result<()> {
        let ttl = self.ttl();
        self.cache.put(user_id, session, ttl).await?;
        tracing::debug!(user_id = %user_id, ttl_secs = ttl.as_secs(), "Session stored");
        Ok(())
    }

    /// End the user's session; false if there was none
    pub async fn invalidate(&self, user_id: UserId) -> Result<bool> {
        self.cache.invalidate(&user_id).await
    }

    /// Invalidate every session currently held.
    ///
    /// Not atomic: keys are invalidated independently, and sessions put
    /// concurrently may survive. Every key is attempted; the first failure is
    /// returned afterwards. Returns the number of sessions removed.
    pub async fn invalidate_all(&self) -> Result<usize> {
        let users = self.cache.keys();
        let results = join_all(users.iter().map(|user_id| self.cache.invalidate(user_id))).await;

        let mut removed = 0;
        let mut first_error: Option<WardenError> = None;
        for (user_id, result) in users.iter().zip(results) {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to invalidate session");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(removed, attempted = users.len(), "Invalidated all sessions");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Change the TTL applied by later `put`s; stored sessions keep theirs
    pub fn reconfigure(&self, ttl: Duration) -> Result<()> {
        validate_ttl(ttl)?;
        *self.ttl.write().unwrap_or_else(PoisonError::into_inner) = ttl;
        tracing::info!(ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), "Session TTL reconfigured");
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notifier(&self) -> &Arc<LogoutNotifier> {
        &self.notifier
    }

    /// Users with a live session on this node's replica
    pub fn user_count(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(WardenError::InvalidInput("session TTL must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthenticationListener, InMemoryUserDirectory};
    use crate::config::{CacheConfig, ClusterConfig};
    use warden_common::User;

    #[derive(Default)]
    struct Recording {
        logouts: Mutex<Vec<(UserId, Properties)>>,
    }

    impl Recording {
        fn count(&self) -> usize {
            self.logouts.lock().unwrap().len()
        }

        fn users(&self) -> Vec<UserId> {
            self.logouts.lock().unwrap().iter().map(|(u, _)| *u).collect()
        }
    }

    impl AuthenticationListener for Recording {
        fn on_logout(&self, user: &User, properties: &Properties) -> anyhow::Result<()> {
            self.logouts.lock().unwrap().push((user.id, properties.clone()));
            Ok(())
        }
    }

    struct Throwing;

    impl AuthenticationListener for Throwing {
        fn on_logout(&self, _user: &User, _properties: &Properties) -> anyhow::Result<()> {
            anyhow::bail!("listener rejected logout")
        }
    }

    fn uid(id: u64) -> UserId {
        UserId::new(id).unwrap()
    }

    fn cluster_config(name: &str) -> ClusterConfig {
        ClusterConfig {
            cluster_name: "session-test".to_string(),
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval_ms: 50,
            member_timeout_ms: 3_000,
            retransmit_interval_ms: 50,
            join_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn cache_config() -> CacheConfig {
        CacheConfig {
            reaper_interval_ms: 10,
            replication_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn directory(ids: &[u64]) -> Arc<InMemoryUserDirectory> {
        let directory = InMemoryUserDirectory::new();
        for id in ids {
            directory.insert(User::new(uid(*id), format!("user-{id}")));
        }
        Arc::new(directory)
    }

    struct Node {
        manager: ClusterCacheManager,
        sessions: AuthenticationSessionCache,
        recording: Arc<Recording>,
    }

    async fn node(config: ClusterConfig, ttl: Duration, users: &[u64]) -> Node {
        let manager = ClusterCacheManager::new(config, cache_config());
        manager.start().await.unwrap();
        let notifier = Arc::new(LogoutNotifier::new(directory(users)));
        let recording = Arc::new(Recording::default());
        notifier.register(recording.clone());
        let sessions = AuthenticationSessionCache::new(&manager, notifier, ttl)
            .await
            .unwrap();
        Node {
            manager,
            sessions,
            recording,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_session_logs_out_once() {
        let node = node(cluster_config("node-a"), Duration::from_millis(100), &[42]).await;
        let session = Session::new("alice").with_attribute("client", "web");

        node.sessions.put(uid(42), session.clone()).await.unwrap();
        assert_eq!(node.sessions.get(uid(42)).await.unwrap(), Some(session));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(node.sessions.get(uid(42)).await.unwrap(), None);

        assert!(eventually(|| node.recording.count() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.recording.count(), 1);

        let logouts = node.recording.logouts.lock().unwrap().clone();
        let properties = &logouts[0].1;
        assert_eq!(properties.get(logout_properties::CAUSE).map(String::as_str), Some("expired"));
        assert_eq!(properties.get(logout_properties::PRINCIPAL).map(String::as_str), Some("alice"));
        assert_eq!(properties.get("client").map(String::as_str), Some("web"));
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_listener_does_not_block_others() {
        let manager = ClusterCacheManager::new(cluster_config("node-a"), cache_config());
        manager.start().await.unwrap();
        let notifier = Arc::new(LogoutNotifier::new(directory(&[7])));
        let recording = Arc::new(Recording::default());
        notifier.register(Arc::new(Throwing));
        notifier.register(recording.clone());
        let sessions = AuthenticationSessionCache::new(&manager, notifier, Duration::from_secs(60))
            .await
            .unwrap();

        sessions.put(uid(7), Session::new("bob")).await.unwrap();
        tokio_test::assert_ok!(sessions.invalidate(uid(7)).await);

        assert!(eventually(|| recording.count() == 1).await);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_user_removal_notifies_nobody() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[]).await;

        node.sessions.put(uid(9), Session::new("ghost")).await.unwrap();
        assert!(node.sessions.invalidate(uid(9)).await.unwrap());
        assert_eq!(node.sessions.get(uid(9)).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.recording.count(), 0);
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overwrite_does_not_log_out() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[5]).await;
        let b = Session::new("carol").with_attribute("token", "b");

        node.sessions.put(uid(5), Session::new("carol")).await.unwrap();
        node.sessions.put(uid(5), b.clone()).await.unwrap();
        assert_eq!(node.sessions.get(uid(5)).await.unwrap(), Some(b));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.recording.count(), 0);
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidating_absent_session_is_a_no_op() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[3]).await;

        assert!(!node.sessions.invalidate(uid(3)).await.unwrap());
        node.sessions.put(uid(3), Session::new("dave")).await.unwrap();
        assert!(node.sessions.invalidate(uid(3)).await.unwrap());
        assert!(!node.sessions.invalidate(uid(3)).await.unwrap());

        assert!(eventually(|| node.recording.count() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.recording.count(), 1);
        node.manager.shutdown().await;
    }

    #[test]
    fn duplicate_removals_reach_listeners_once() {
        let notifier = Arc::new(LogoutNotifier::new(directory(&[11])));
        let recording = Arc::new(Recording::default());
        notifier.register(recording.clone());
        let dispatch = LogoutDispatch {
            notifier,
            recent: Mutex::new(RecentRemovals::new()),
        };

        let event = RemovalEvent {
            key: uid(11),
            value: Session::new("erin"),
            cause: RemovalCause::Invalidated,
            version: Version::new(4, "node-a"),
            origin: "node-a".to_string(),
        };
        dispatch.on_removal(&event);
        // Same removal observed again as an expiry
        dispatch.on_removal(&RemovalEvent {
            cause: RemovalCause::Expired,
            ..event.clone()
        });
        assert_eq!(recording.count(), 1);

        // A later session for the same user is a different removal
        dispatch.on_removal(&RemovalEvent {
            version: Version::new(9, "node-a"),
            ..event
        });
        assert_eq!(recording.count(), 2);
    }

    #[test]
    fn recent_removals_are_bounded() {
        let mut recent = RecentRemovals::new();
        for counter in 0..(RECENT_REMOVALS as u64 + 10) {
            assert!(recent.insert(uid(1), &Version::new(counter, "n")));
        }
        assert_eq!(recent.order.len(), RECENT_REMOVALS);
        assert_eq!(recent.seen.len(), RECENT_REMOVALS);
        // The oldest entries were forgotten
        assert!(recent.insert(uid(1), &Version::new(0, "n")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconfigure_applies_to_later_puts() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[1, 2]).await;

        node.sessions.put(uid(1), Session::new("long")).await.unwrap();
        node.sessions.reconfigure(Duration::from_millis(50)).unwrap();
        assert_eq!(node.sessions.ttl(), Duration::from_millis(50));
        node.sessions.put(uid(2), Session::new("short")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(node.sessions.get(uid(1)).await.unwrap().is_some());
        assert!(node.sessions.get(uid(2)).await.unwrap().is_none());

        assert!(matches!(
            node.sessions.reconfigure(Duration::ZERO),
            Err(WardenError::InvalidInput(_))
        ));
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconfigure_accepts_the_largest_ttl() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[1]).await;

        tokio_test::assert_ok!(node.sessions.reconfigure(Duration::MAX));
        assert_eq!(node.sessions.ttl(), Duration::MAX);
        node.sessions.put(uid(1), Session::new("forever")).await.unwrap();
        assert!(node.sessions.get(uid(1)).await.unwrap().is_some());
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidate_all_removes_every_session() {
        let node = node(cluster_config("node-a"), Duration::from_secs(60), &[1, 2, 3]).await;
        for id in 1..=3 {
            node.sessions.put(uid(id), Session::new(format!("user-{id}"))).await.unwrap();
        }
        assert_eq!(node.sessions.user_count(), 3);

        assert_eq!(node.sessions.invalidate_all().await.unwrap(), 3);
        assert_eq!(node.sessions.user_count(), 0);
        assert_eq!(node.sessions.invalidate_all().await.unwrap(), 0);

        assert!(eventually(|| node.recording.count() == 3).await);
        let mut users = node.recording.users();
        users.sort();
        assert_eq!(users, vec![uid(1), uid(2), uid(3)]);
        node.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logout_fans_out_across_nodes() {
        let a = node(cluster_config("node-a"), Duration::from_secs(60), &[21]).await;
        let seed = a.manager.local_addr().await.unwrap();

        let mut b_config = cluster_config("node-b");
        b_config.seeds = vec![seed.to_string()];
        b_config.initial_cluster_size = 2;
        let b = node(b_config, Duration::from_secs(60), &[21]).await;
        assert!(!b.manager.is_standalone().await);

        let session = Session::new("frank");
        a.sessions.put(uid(21), session.clone()).await.unwrap();
        assert_eq!(b.sessions.get(uid(21)).await.unwrap(), Some(session));

        assert!(b.sessions.invalidate(uid(21)).await.unwrap());
        assert_eq!(a.sessions.get(uid(21)).await.unwrap(), None);

        assert!(eventually(|| a.recording.count() == 1 && b.recording.count() == 1).await);
        let logouts = a.recording.logouts.lock().unwrap().clone();
        assert_eq!(
            logouts[0].1.get(logout_properties::ORIGIN).map(String::as_str),
            Some("node-b")
        );

        b.manager.shutdown().await;
        a.manager.shutdown().await;
    }
}
