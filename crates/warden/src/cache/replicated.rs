//! Replicated cache with per-entry TTL and removal events.
//!
//! Every node holds a full replica. Writes are applied locally, then
//! replicated synchronously to all confirmed members; replicas apply a write
//! only if its [`Version`] is newer than what they hold, so concurrent writes
//! to one key converge on the same winner everywhere.
//!
//! Removals (explicit, invalidation, expiry) are raised as [`RemovalEvent`]s
//! on every node that held the entry, at most once per removed version.
//! Events are delivered to [`RemovalListener`]s on a dedicated dispatch
//! thread owned by the cache.

use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

use warden_common::{RemovalCause, Result, WardenError};

use super::near::NearCache;
use crate::cluster::wire::{CacheOp, WireEntry, decode_value, encode_value};
use crate::cluster::{ClusterTransport, ReplicaHandler, Version};
use crate::config::CacheConfig;

/// Bounds for cache keys
pub trait CacheKey:
    Serialize + DeserializeOwned + Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Serialize + DeserializeOwned + Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Bounds for cache values
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// An entry left the cache
#[derive(Debug, Clone)]
pub struct RemovalEvent<K, V> {
    pub key: K,
    /// Last value held for the key
    pub value: V,
    pub cause: RemovalCause,
    /// Version of the removed entry; identifies the removal
    pub version: Version,
    /// Node that originated the removal
    pub origin: String,
}

/// Observer of removal events.
///
/// Runs on the cache's dispatch thread. Must not synchronously call back into
/// `put`/`remove` on the same cache.
pub trait RemovalListener<K, V>: Send + Sync {
    fn on_removal(&self, event: &RemovalEvent<K, V>);
}

/// Counters exposed through [`ReplicatedCache::stats`]
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub near_entries: usize,
    pub hits: u64,
    pub near_hits: u64,
    pub misses: u64,
    pub remote_fetches: u64,
    pub puts: u64,
    pub removals: u64,
    pub expirations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    near_hits: AtomicU64,
    misses: AtomicU64,
    remote_fetches: AtomicU64,
    puts: AtomicU64,
    removals: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Entry<V> {
    value: V,
    version: Version,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Tombstone {
    version: Version,
    recorded_at: Instant,
}

enum PutOutcome<V> {
    /// Stored; carries the previous entry if it had already expired
    Applied { expired: Option<Entry<V>> },
    /// A newer write or removal is already known
    Stale,
}

struct Store<K, V> {
    entries: HashMap<K, Entry<V>>,
    tombstones: HashMap<K, Tombstone>,
}

impl<K: Eq + Hash + Clone, V> Store<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn removed_at_or_after(&self, key: &K, version: &Version) -> bool {
        self.tombstones
            .get(key)
            .is_some_and(|t| t.version >= *version)
    }

    fn tombstone(&mut self, key: K, version: Version) {
        let replace = self
            .tombstones
            .get(&key)
            .is_none_or(|t| t.version < version);
        if replace {
            self.tombstones.insert(
                key,
                Tombstone {
                    version,
                    recorded_at: Instant::now(),
                },
            );
        }
    }

    fn put(&mut self, key: K, entry: Entry<V>, now: Instant) -> PutOutcome<V> {
        if self.removed_at_or_after(&key, &entry.version) {
            return PutOutcome::Stale;
        }
        if self
            .entries
            .get(&key)
            .is_some_and(|current| current.version >= entry.version)
        {
            return PutOutcome::Stale;
        }

        let expired = self
            .entries
            .insert(key.clone(), entry)
            .filter(|previous| !previous.is_live(now));
        if let Some(ref previous) = expired {
            self.tombstone(key, previous.version.clone());
        }
        PutOutcome::Applied { expired }
    }

    fn live(&self, key: &K, now: Instant) -> Option<&Entry<V>> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    /// Remove a live entry (local remove/invalidate)
    fn take_live(&mut self, key: &K, now: Instant) -> Option<Entry<V>> {
        self.live(key, now)?;
        let entry = self.entries.remove(key)?;
        self.tombstone(key.clone(), entry.version.clone());
        Some(entry)
    }

    /// Remove exactly the entry written at `version` (reaper)
    fn take_exact(&mut self, key: &K, version: &Version) -> Option<Entry<V>> {
        if self.entries.get(key)?.version != *version {
            return None;
        }
        let entry = self.entries.remove(key)?;
        self.tombstone(key.clone(), entry.version.clone());
        Some(entry)
    }

    /// Apply a replicated removal of the entry written at `version`
    fn apply_remove(&mut self, key: &K, version: &Version) -> Option<Entry<V>> {
        if self.removed_at_or_after(key, version) {
            return None;
        }
        match self.entries.get(key) {
            // A newer write won; the removal targeted an older value
            Some(current) if current.version > *version => None,
            Some(_) => {
                let entry = self.entries.remove(key);
                self.tombstone(key.clone(), version.clone());
                entry
            }
            None => {
                self.tombstone(key.clone(), version.clone());
                None
            }
        }
    }
}

/// Copy-on-write listener list; dispatch iterates a snapshot
struct ListenerSet<K, V> {
    listeners: RwLock<Arc<Vec<Arc<dyn RemovalListener<K, V>>>>>,
}

impl<K, V> ListenerSet<K, V> {
    fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn add(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        next.push(listener);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn RemovalListener<K, V>>>> {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn dispatch(&self, event: &RemovalEvent<K, V>) {
        for listener in self.snapshot().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_removal(event))).is_err() {
                tracing::error!(cause = %event.cause, version = %event.version, "Removal listener panicked");
            }
        }
    }
}

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A named cache replicated across the cluster
pub struct ReplicatedCache<K, V> {
    name: String,
    transport: Arc<ClusterTransport>,
    config: CacheConfig,
    store: Mutex<Store<K, V>>,
    near: NearCache<K, V>,
    listeners: Arc<ListenerSet<K, V>>,
    events: Mutex<Option<mpsc::UnboundedSender<RemovalEvent<K, V>>>>,
    counters: Counters,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> ReplicatedCache<K, V> {
    /// Create the cache, start its dispatch thread and reaper, and join it
    /// to cluster replication.
    pub(crate) async fn create(
        name: &str,
        transport: Arc<ClusterTransport>,
        config: CacheConfig,
    ) -> Result<Arc<Self>> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<RemovalEvent<K, V>>();
        let listeners = Arc::new(ListenerSet::new());

        let dispatch_listeners = Arc::clone(&listeners);
        let thread_cache = name.to_string();
        std::thread::Builder::new()
            .name(format!("warden-events-{name}"))
            .spawn(move || {
                while let Some(event) = events_rx.blocking_recv() {
                    dispatch_listeners.dispatch(&event);
                }
                tracing::debug!(cache = %thread_cache, "Removal dispatcher stopped");
            })
            .map_err(|e| WardenError::Internal(format!("failed to spawn event dispatcher: {e}")))?;

        let (shutdown, _) = broadcast::channel(1);
        let cache = Arc::new(Self {
            name: name.to_string(),
            near: NearCache::new(config.near_cache_lifespan(), config.near_cache_max_entries),
            transport: Arc::clone(&transport),
            config,
            store: Mutex::new(Store::new()),
            listeners,
            events: Mutex::new(Some(events_tx)),
            counters: Counters::default(),
            shutdown,
            stopped: AtomicBool::new(false),
        });

        let reaper = Arc::downgrade(&cache);
        let interval = cache.config.reaper_interval();
        let shutdown = cache.shutdown.subscribe();
        tokio::spawn(run_reaper(reaper, interval, shutdown));

        transport
            .register_handler(name, Arc::clone(&cache) as Arc<dyn ReplicaHandler>)
            .await;

        tracing::info!(cache = %name, node = %transport.node_name(), "Replicated cache started");
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to removal events (all causes)
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        self.listeners.add(listener);
    }

    /// Store `value` under `key` for `ttl`, replacing any previous value.
    ///
    /// Returns once every confirmed member has acknowledged the write. On
    /// `ReplicationTimeout` the write may or may not have landed elsewhere.
    pub async fn put(&self, key: K, value: V, ttl: Duration) -> Result<()> {
        self.ensure_running()?;
        let version = self.transport.next_version();

        // Encoded up front: a write that cannot be replicated is not stored
        let op = CacheOp::Put {
            key: encode_value(&key)?,
            entry: WireEntry {
                value: encode_value(&value)?,
                version: version.clone(),
                ttl_remaining_ms: millis(ttl),
            },
        };
        let replication = self.transport.prepare(&self.name, op)?;

        let now = Instant::now();
        let entry = Entry {
            value,
            version,
            expires_at: deadline(now, ttl),
        };

        let outcome = {
            let mut store = self.lock_store();
            let outcome = store.put(key.clone(), entry, now);
            self.near.invalidate(&key);
            outcome
        };
        match outcome {
            PutOutcome::Applied { expired: Some(previous) } => {
                Counters::bump(&self.counters.expirations);
                self.raise(key.clone(), previous, RemovalCause::Expired, self.transport.node_name());
            }
            PutOutcome::Applied { expired: None } => {}
            PutOutcome::Stale => {
                tracing::debug!(cache = %self.name, key = ?key, "Local write superseded by a newer version");
            }
        }
        Counters::bump(&self.counters.puts);

        self.transport
            .send_replication(replication, self.config.replication_timeout())
            .await?;

        tracing::debug!(cache = %self.name, key = ?key, ttl_ms = millis(ttl), "Entry stored");
        Ok(())
    }

    /// Read a live value.
    ///
    /// Served from the near-cache when fresh; otherwise the key's owner is
    /// consulted (falling back to the local replica if it does not answer).
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_running()?;

        if let Some(value) = self.near.get(key) {
            Counters::bump(&self.counters.near_hits);
            Counters::bump(&self.counters.hits);
            return Ok(Some(value));
        }

        let key_bytes = encode_value(key)?;
        let owner = self.transport.owner_of(&key_bytes).await;
        if owner != self.transport.node_name() {
            Counters::bump(&self.counters.remote_fetches);
            match self
                .transport
                .fetch(&owner, &self.name, key_bytes, self.config.fetch_timeout())
                .await
            {
                Ok(Some(entry)) => self.apply_put(key.clone(), entry),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(cache = %self.name, owner = %owner, error = %e, "Owner fetch failed, using local replica");
                }
            }
        }

        let now = Instant::now();
        let found = {
            let store = self.lock_store();
            let found = store.live(key, now).map(|e| (e.value.clone(), e.expires_at));
            // Populated under the store lock so a concurrent removal can't be missed
            if let Some((ref value, expires_at)) = found {
                self.near.insert(key.clone(), value.clone(), expires_at);
            }
            found
        };

        match found {
            Some((value, _)) => {
                Counters::bump(&self.counters.hits);
                Ok(Some(value))
            }
            None => {
                Counters::bump(&self.counters.misses);
                Ok(None)
            }
        }
    }

    /// Remove `key` through the raw cache API (cause `ExplicitRemoval`).
    ///
    /// Returns whether a live entry was removed; absent keys are a no-op.
    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.remove_with_cause(key, RemovalCause::ExplicitRemoval).await
    }

    /// Remove `key` because its value is no longer valid (cause `Invalidated`)
    pub async fn invalidate(&self, key: &K) -> Result<bool> {
        self.remove_with_cause(key, RemovalCause::Invalidated).await
    }

    async fn remove_with_cause(&self, key: &K, cause: RemovalCause) -> Result<bool> {
        self.ensure_running()?;
        let key_bytes = encode_value(key)?;

        let removed = {
            let mut store = self.lock_store();
            let removed = store.take_live(key, Instant::now());
            self.near.invalidate(key);
            removed
        };
        let Some(entry) = removed else {
            return Ok(false);
        };

        let version = entry.version.clone();
        Counters::bump(&self.counters.removals);
        self.raise(key.clone(), entry, cause, self.transport.node_name());

        let op = CacheOp::Remove {
            key: key_bytes,
            version,
            cause,
        };
        self.transport
            .replicate(&self.name, op, self.config.replication_timeout())
            .await?;
        Ok(true)
    }

    /// Snapshot of live keys
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.lock_store()
            .entries
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of live entries on this replica
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock_store()
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            entries: self.len(),
            near_entries: self.near.len(),
            hits: load(&self.counters.hits),
            near_hits: load(&self.counters.near_hits),
            misses: load(&self.counters.misses),
            remote_fetches: load(&self.counters.remote_fetches),
            puts: load(&self.counters.puts),
            removals: load(&self.counters.removals),
            expirations: load(&self.counters.expirations),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(WardenError::ShutDown);
        }
        Ok(())
    }

    fn lock_store(&self) -> MutexGuard<'_, Store<K, V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single exit for every removal, whatever its cause
    fn raise(&self, key: K, entry: Entry<V>, cause: RemovalCause, origin: &str) {
        tracing::debug!(
            cache = %self.name,
            key = ?key,
            cause = %cause,
            version = %entry.version,
            origin = %origin,
            "Entry removed"
        );
        let event = RemovalEvent {
            key,
            value: entry.value,
            cause,
            version: entry.version,
            origin: origin.to_string(),
        };
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Merge a replicated or fetched entry
    fn apply_put(&self, key: K, wire: WireEntry) {
        let value: V = match decode_value(&wire.value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(cache = %self.name, error = %e, "Dropping undecodable value");
                return;
            }
        };
        let now = Instant::now();
        let entry = Entry {
            value,
            version: wire.version,
            expires_at: deadline(now, Duration::from_millis(wire.ttl_remaining_ms)),
        };

        let outcome = {
            let mut store = self.lock_store();
            let outcome = store.put(key.clone(), entry, now);
            if matches!(outcome, PutOutcome::Applied { .. }) {
                self.near.invalidate(&key);
            }
            outcome
        };
        match outcome {
            PutOutcome::Applied { expired: Some(previous) } => {
                Counters::bump(&self.counters.expirations);
                self.raise(key, previous, RemovalCause::Expired, self.transport.node_name());
            }
            PutOutcome::Applied { expired: None } => {}
            PutOutcome::Stale => {
                tracing::trace!(cache = %self.name, key = ?key, "Ignoring stale write");
            }
        }
    }

    /// Expire entries this node owns; clean up orphans nobody expired
    async fn reap(&self) {
        let now = Instant::now();
        let expired: Vec<(K, Version, Instant)> = self
            .lock_store()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(k, e)| (k.clone(), e.version.clone(), e.expires_at))
            .collect();

        let orphan_grace = self.config.replication_timeout() * 2;
        for (key, version, expires_at) in expired {
            let key_bytes = match encode_value(&key) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(cache = %self.name, error = %e, "Failed to encode expired key");
                    continue;
                }
            };
            let owner = self.transport.owner_of(&key_bytes).await;
            let is_owner = owner == self.transport.node_name();
            if !is_owner && now.duration_since(expires_at) < orphan_grace {
                continue;
            }

            let removed = {
                let mut store = self.lock_store();
                let removed = store.take_exact(&key, &version);
                self.near.invalidate(&key);
                removed
            };
            let Some(entry) = removed else {
                continue;
            };

            Counters::bump(&self.counters.expirations);
            if !is_owner {
                tracing::debug!(cache = %self.name, key = ?key, owner = %owner, "Expiring entry the owner never removed");
            }
            self.raise(key, entry, RemovalCause::Expired, self.transport.node_name());

            if is_owner {
                let op = CacheOp::Remove {
                    key: key_bytes,
                    version,
                    cause: RemovalCause::Expired,
                };
                let transport = Arc::clone(&self.transport);
                let name = self.name.clone();
                let timeout = self.config.replication_timeout();
                tokio::spawn(async move {
                    if let Err(e) = transport.replicate(&name, op, timeout).await {
                        tracing::warn!(cache = %name, error = %e, "Failed to replicate expiry");
                    }
                });
            }
        }

        let tombstone_ttl = self.config.tombstone_ttl();
        self.lock_store()
            .tombstones
            .retain(|_, t| t.recorded_at.elapsed() < tombstone_ttl);
        self.near.purge();
    }
}

async fn run_reaper<K: CacheKey, V: CacheValue>(
    cache: Weak<ReplicatedCache<K, V>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.reap().await;
            }
            _ = shutdown.recv() => break,
        }
    }
}

impl<K: CacheKey, V: CacheValue> ReplicaHandler for ReplicatedCache<K, V> {
    fn apply(&self, from: &str, op: CacheOp) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        match op {
            CacheOp::Put { key, entry } => match decode_value::<K>(&key) {
                Ok(key) => self.apply_put(key, entry),
                Err(e) => tracing::warn!(cache = %self.name, peer = %from, error = %e, "Dropping undecodable key"),
            },
            CacheOp::Remove { key, version, cause } => {
                let key: K = match decode_value(&key) {
                    Ok(k) => k,
                    Err(e) => {
                        tracing::warn!(cache = %self.name, peer = %from, error = %e, "Dropping undecodable key");
                        return;
                    }
                };
                let removed = {
                    let mut store = self.lock_store();
                    let removed = store.apply_remove(&key, &version);
                    if removed.is_some() {
                        self.near.invalidate(&key);
                    }
                    removed
                };
                if let Some(entry) = removed {
                    match cause {
                        RemovalCause::Expired => Counters::bump(&self.counters.expirations),
                        _ => Counters::bump(&self.counters.removals),
                    }
                    self.raise(key, entry, cause, from);
                }
            }
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<WireEntry> {
        let key: K = decode_value(key).ok()?;
        let now = Instant::now();
        let store = self.lock_store();
        let entry = store.live(&key, now)?;
        Some(WireEntry {
            value: encode_value(&entry.value).ok()?,
            version: entry.version.clone(),
            ttl_remaining_ms: millis(entry.expires_at.saturating_duration_since(now)),
        })
    }

    fn snapshot(&self) -> Vec<CacheOp> {
        let now = Instant::now();
        let store = self.lock_store();
        store
            .entries
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .filter_map(|(k, e)| {
                Some(CacheOp::Put {
                    key: encode_value(k).ok()?,
                    entry: WireEntry {
                        value: encode_value(&e.value).ok()?,
                        version: e.version.clone(),
                        ttl_remaining_ms: millis(e.expires_at.saturating_duration_since(now)),
                    },
                })
            })
            .collect()
    }
}

/// Lifecycle hook used by the cache manager
pub(crate) trait ManagedCache: Send + Sync {
    fn stop(&self);
}

impl<K: CacheKey, V: CacheValue> ManagedCache for ReplicatedCache<K, V> {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        // Closing the queue lets the dispatcher drain and exit
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.near.clear();
        tracing::info!(cache = %self.name, "Replicated cache stopped");
    }
}
