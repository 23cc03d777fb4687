//! Cluster transport (UDP)
//!
//! Carries membership gossip and cache replication between nodes. Each node
//! heartbeats its member list to seeds and known peers; a peer becomes a
//! confirmed member (and part of every replica set) once it has talked to us
//! directly, and is dropped after `member_timeout` of silence.
//!
//! Replication is acknowledged: [`ClusterTransport::replicate`] resends a
//! mutation to every replica that has not acked yet, until all have or the
//! deadline passes.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast, oneshot, watch};

use warden_common::constants::MAX_DATAGRAM_SIZE;
use warden_common::{ClusterNode, Result, WardenError};

use super::clock::{LamportClock, Version};
use super::wire::{self, CacheOp, Envelope, MemberInfo, Message, WireEntry};
use crate::config::ClusterConfig;

/// Receives replication traffic for one named cache.
///
/// Called on the transport's receive task; implementations must not block.
pub trait ReplicaHandler: Send + Sync {
    /// Apply a mutation replicated from `from`
    fn apply(&self, from: &str, op: CacheOp);

    /// Read a live entry for a remote owner fetch
    fn lookup(&self, key: &[u8]) -> Option<WireEntry>;

    /// All live entries, as puts, for state transfer
    fn snapshot(&self) -> Vec<CacheOp>;
}

/// A known peer
#[derive(Clone, Debug)]
struct Member {
    node: ClusterNode,
    addr: SocketAddr,
    last_seen: Instant,
    /// Has talked to us directly (gossip-only peers are not replicas)
    confirmed: bool,
}

/// An encoded mutation, ready to send
pub struct Replication {
    op_id: u64,
    operation: &'static str,
    cache: String,
    bytes: Vec<u8>,
}

struct PendingAck {
    waiting: HashSet<String>,
    expected: usize,
    done: Option<oneshot::Sender<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cluster transport bound to one UDP socket
pub struct ClusterTransport {
    node: ClusterNode,
    socket: UdpSocket,
    local_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    heartbeat_interval: Duration,
    member_timeout: Duration,
    retransmit_interval: Duration,
    clock: LamportClock,
    members: RwLock<HashMap<String, Member>>,
    member_count: watch::Sender<usize>,
    handlers: RwLock<HashMap<String, Arc<dyn ReplicaHandler>>>,
    pending_acks: Mutex<HashMap<u64, PendingAck>>,
    pending_fetches: Mutex<HashMap<u64, oneshot::Sender<Option<WireEntry>>>>,
    next_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl ClusterTransport {
    /// Bind the transport socket and resolve seeds.
    ///
    /// Fails with `ClusterBootstrap` if the socket cannot be bound.
    pub async fn bind(config: &ClusterConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(&config.bind_addr).await.map_err(|e| {
            WardenError::ClusterBootstrap(format!("failed to bind {}: {e}", config.bind_addr))
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| WardenError::ClusterBootstrap(format!("no local address: {e}")))?;

        let mut seeds = Vec::new();
        for seed in &config.seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => seeds.extend(addrs.filter(|a| *a != local_addr)),
                Err(e) => tracing::warn!(seed = %seed, error = %e, "Failed to resolve seed"),
            }
        }

        let (member_count, _) = watch::channel(1);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            node: config.node(),
            socket,
            local_addr,
            seeds,
            heartbeat_interval: config.heartbeat_interval(),
            member_timeout: config.member_timeout(),
            retransmit_interval: config.retransmit_interval(),
            clock: LamportClock::new(),
            members: RwLock::new(HashMap::new()),
            member_count,
            handlers: RwLock::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            pending_fetches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }))
    }

    /// Spawn the receive and heartbeat loops
    pub fn spawn(self: &Arc<Self>) {
        let receiver = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { receiver.run_receiver(shutdown).await });

        let heartbeat = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { heartbeat.run_heartbeat(shutdown).await });
    }

    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    pub fn node_name(&self) -> &str {
        &self.node.node_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Watch the member count (self included)
    pub fn member_count(&self) -> watch::Receiver<usize> {
        self.member_count.subscribe()
    }

    /// Confirmed members, sorted by name
    pub async fn members(&self) -> Vec<MemberInfo> {
        let members = self.members.read().await;
        let mut list: Vec<_> = members
            .values()
            .filter(|m| m.confirmed)
            .map(|m| MemberInfo {
                node: m.node.clone(),
                addr: m.addr,
            })
            .collect();
        list.sort_by(|a, b| a.node.node_name.cmp(&b.node.node_name));
        list
    }

    /// Issue a version newer than anything this node has seen
    pub fn next_version(&self) -> Version {
        Version::new(self.clock.tick(), self.node.node_name.clone())
    }

    /// Owner of a key: rendezvous hash over self and confirmed members
    pub async fn owner_of(&self, key: &[u8]) -> String {
        let members = self.members.read().await;
        let candidates = std::iter::once(self.node.node_name.as_str())
            .chain(members.values().filter(|m| m.confirmed).map(|m| m.node.node_name.as_str()));
        rendezvous_owner(key, candidates).unwrap_or_else(|| self.node.node_name.clone())
    }

    /// Route replication traffic for `cache` to `handler` and pull state
    /// from every current member.
    pub async fn register_handler(&self, cache: &str, handler: Arc<dyn ReplicaHandler>) {
        self.handlers.write().await.insert(cache.to_string(), handler);

        let targets: Vec<SocketAddr> = self.members().await.into_iter().map(|m| m.addr).collect();
        for addr in targets {
            self.send_to(
                addr,
                Message::SyncRequest {
                    cache: cache.to_string(),
                },
            )
            .await;
        }
    }

    /// Encode a mutation for replication.
    ///
    /// Fails with `InvalidInput` if it would not fit in one datagram, so
    /// callers can check before applying the mutation locally.
    pub fn prepare(&self, cache: &str, op: CacheOp) -> Result<Replication> {
        let op_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = match op {
            CacheOp::Put { .. } => "put",
            CacheOp::Remove { .. } => "remove",
        };
        let bytes = wire::encode(&self.envelope(Message::Replicate {
            op_id,
            cache: cache.to_string(),
            op,
        }))?;
        Ok(Replication {
            op_id,
            operation,
            cache: cache.to_string(),
            bytes,
        })
    }

    /// Send a mutation to every confirmed member and wait for all acks.
    pub async fn replicate(&self, cache: &str, op: CacheOp, timeout: Duration) -> Result<()> {
        let replication = self.prepare(cache, op)?;
        self.send_replication(replication, timeout).await
    }

    /// Send a prepared mutation to every confirmed member and wait for all
    /// acks, resending until `timeout`.
    pub async fn send_replication(&self, replication: Replication, timeout: Duration) -> Result<()> {
        let Replication {
            op_id,
            operation,
            cache,
            bytes,
        } = replication;

        let targets: Vec<(String, SocketAddr)> = {
            let members = self.members.read().await;
            members
                .values()
                .filter(|m| m.confirmed)
                .map(|m| (m.node.node_name.clone(), m.addr))
                .collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        let (done_tx, mut done_rx) = oneshot::channel();
        lock(&self.pending_acks).insert(
            op_id,
            PendingAck {
                waiting: targets.iter().map(|(name, _)| name.clone()).collect(),
                expected: targets.len(),
                done: Some(done_tx),
            },
        );

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let waiting: Vec<SocketAddr> = {
                let pending = lock(&self.pending_acks);
                match pending.get(&op_id) {
                    Some(p) => targets
                        .iter()
                        .filter(|(name, _)| p.waiting.contains(name))
                        .map(|(_, addr)| *addr)
                        .collect(),
                    None => Vec::new(),
                }
            };
            for addr in waiting {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    tracing::warn!(peer = %addr, error = %e, "Failed to send replication");
                }
            }

            let resend_at = (tokio::time::Instant::now() + self.retransmit_interval).min(deadline);
            tokio::select! {
                result = &mut done_rx => {
                    return match result {
                        Ok(()) => Ok(()),
                        Err(_) => Err(WardenError::ShutDown),
                    };
                }
                _ = tokio::time::sleep_until(resend_at) => {
                    if tokio::time::Instant::now() >= deadline {
                        let (acked, expected) = match lock(&self.pending_acks).remove(&op_id) {
                            Some(p) => (p.expected - p.waiting.len(), p.expected),
                            None => (targets.len(), targets.len()),
                        };
                        tracing::warn!(
                            cache = %cache,
                            op_id,
                            acked,
                            expected,
                            "Replication timed out"
                        );
                        return Err(WardenError::ReplicationTimeout {
                            operation: operation.to_string(),
                            acked,
                            expected,
                        });
                    }
                }
            }
        }
    }

    /// Read a key from a remote member
    pub async fn fetch(
        &self,
        owner: &str,
        cache: &str,
        key: Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<WireEntry>> {
        let addr = {
            let members = self.members.read().await;
            members
                .get(owner)
                .filter(|m| m.confirmed)
                .map(|m| m.addr)
                .ok_or_else(|| WardenError::Transport(format!("unknown member {owner}")))?
        };

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_fetches).insert(request_id, tx);

        self.send_to(
            addr,
            Message::Fetch {
                request_id,
                cache: cache.to_string(),
                key,
            },
        )
        .await;

        let result = tokio::time::timeout(timeout, rx).await;
        lock(&self.pending_fetches).remove(&request_id);
        match result {
            Ok(Ok(entry)) => Ok(entry),
            Ok(Err(_)) => Err(WardenError::ShutDown),
            Err(_) => Err(WardenError::Transport(format!("fetch from {owner} timed out"))),
        }
    }

    /// Announce departure, stop background loops and fail outstanding waits
    pub async fn shutdown(&self) {
        let peers: Vec<SocketAddr> = self.members.read().await.values().map(|m| m.addr).collect();
        for addr in peers {
            self.send_to(addr, Message::Leave).await;
        }

        let _ = self.shutdown.send(());
        self.handlers.write().await.clear();
        self.members.write().await.clear();
        lock(&self.pending_acks).clear();
        lock(&self.pending_fetches).clear();
        self.member_count.send_replace(1);

        tracing::info!(node = %self.node.node_name, "Cluster transport stopped");
    }

    fn envelope(&self, message: Message) -> Envelope {
        Envelope {
            cluster: self.node.cluster_name.clone(),
            from: self.node.node_name.clone(),
            message,
        }
    }

    async fn send_to(&self, addr: SocketAddr, message: Message) {
        let bytes = match wire::encode(&self.envelope(message)) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode cluster message");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            tracing::warn!(peer = %addr, error = %e, "Failed to send cluster message");
        }
    }

    /// Run the datagram receiver
    async fn run_receiver(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        tracing::info!(
            addr = %self.local_addr,
            node = %self.node.node_name,
            "Cluster receiver started"
        );

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                        Err(e) => tracing::warn!(error = %e, "Cluster receive error"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Cluster receiver shutting down");
                    break;
                }
            }
        }
    }

    /// Run the heartbeat broadcaster and member health checks
    async fn run_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast_heartbeat().await;
                    self.check_member_health().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    async fn heartbeat_message(&self) -> Message {
        Message::Heartbeat {
            node: self.node.clone(),
            members: self.members().await,
        }
    }

    async fn broadcast_heartbeat(&self) {
        let message = self.heartbeat_message().await;
        let mut targets: HashSet<SocketAddr> = self.seeds.iter().copied().collect();
        targets.extend(self.members.read().await.values().map(|m| m.addr));

        for addr in targets {
            self.send_to(addr, message.clone()).await;
        }
    }

    /// Drop members that have gone silent
    async fn check_member_health(&self) {
        let expired: Vec<String> = {
            let mut members = self.members.write().await;
            let expired: Vec<String> = members
                .values()
                .filter(|m| m.last_seen.elapsed() > self.member_timeout)
                .map(|m| m.node.node_name.clone())
                .collect();
            for name in &expired {
                if let Some(member) = members.remove(name) {
                    if member.confirmed {
                        tracing::warn!(node = %name, addr = %member.addr, "Member left (timeout)");
                    }
                }
            }
            expired
        };

        if !expired.is_empty() {
            for name in &expired {
                self.release_member(name);
            }
            self.publish_member_count().await;
        }
    }

    async fn publish_member_count(&self) {
        let count = self.members.read().await.values().filter(|m| m.confirmed).count() + 1;
        self.member_count.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    /// A departed member no longer holds up pending writes
    fn release_member(&self, name: &str) {
        let mut pending = lock(&self.pending_acks);
        let finished: Vec<u64> = pending
            .iter_mut()
            .filter_map(|(op_id, p)| {
                p.waiting.remove(name);
                p.waiting.is_empty().then_some(*op_id)
            })
            .collect();
        for op_id in finished {
            if let Some(mut p) = pending.remove(&op_id) {
                if let Some(done) = p.done.take() {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Handle an incoming datagram
    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let envelope = match wire::decode(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Invalid cluster datagram");
                return;
            }
        };

        if envelope.cluster != self.node.cluster_name {
            tracing::trace!(addr = %addr, cluster = %envelope.cluster, "Ignoring foreign cluster");
            return;
        }
        // Don't process our own packets
        if envelope.from == self.node.node_name {
            return;
        }

        let from = envelope.from;
        match envelope.message {
            Message::Heartbeat { node, members, .. } => {
                self.handle_heartbeat(node, addr, members).await;
            }
            Message::Leave => {
                let removed = self.members.write().await.remove(&from);
                if removed.is_some() {
                    tracing::info!(node = %from, "Member left");
                    self.release_member(&from);
                    self.publish_member_count().await;
                }
            }
            Message::Replicate { op_id, cache, op } => {
                self.touch(&from).await;
                self.clock.observe(op.version().counter);
                let handler = self.handlers.read().await.get(&cache).cloned();
                match handler {
                    Some(handler) => handler.apply(&from, op),
                    None => tracing::debug!(cache = %cache, "Replication for unknown cache dropped"),
                }
                if op_id != 0 {
                    self.send_to(addr, Message::Ack { op_id }).await;
                }
            }
            Message::Ack { op_id } => {
                self.touch(&from).await;
                let mut pending = lock(&self.pending_acks);
                let finished = match pending.get_mut(&op_id) {
                    Some(p) => {
                        p.waiting.remove(&from);
                        p.waiting.is_empty()
                    }
                    None => false,
                };
                if finished {
                    if let Some(mut p) = pending.remove(&op_id) {
                        if let Some(done) = p.done.take() {
                            let _ = done.send(());
                        }
                    }
                }
            }
            Message::Fetch {
                request_id,
                cache,
                key,
            } => {
                let handler = self.handlers.read().await.get(&cache).cloned();
                let entry = handler.and_then(|h| h.lookup(&key));
                self.send_to(addr, Message::FetchReply { request_id, entry }).await;
            }
            Message::FetchReply { request_id, entry } => {
                if let Some(entry) = &entry {
                    self.clock.observe(entry.version.counter);
                }
                if let Some(tx) = lock(&self.pending_fetches).remove(&request_id) {
                    let _ = tx.send(entry);
                }
            }
            Message::SyncRequest { cache } => {
                let handler = self.handlers.read().await.get(&cache).cloned();
                let Some(handler) = handler else {
                    return;
                };
                let ops = handler.snapshot();
                tracing::debug!(cache = %cache, peer = %from, entries = ops.len(), "Sending state transfer");
                for op in ops {
                    self.send_to(
                        addr,
                        Message::Replicate {
                            op_id: 0,
                            cache: cache.clone(),
                            op,
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn touch(&self, name: &str) {
        if let Some(member) = self.members.write().await.get_mut(name) {
            member.last_seen = Instant::now();
        }
    }

    async fn handle_heartbeat(&self, node: ClusterNode, addr: SocketAddr, gossip: Vec<MemberInfo>) {
        let newly_confirmed = {
            let mut members = self.members.write().await;
            let name = node.node_name.clone();
            let newly_confirmed = match members.get_mut(&name) {
                Some(member) => {
                    let was_confirmed = member.confirmed;
                    member.node = node.clone();
                    member.addr = addr;
                    member.last_seen = Instant::now();
                    member.confirmed = true;
                    !was_confirmed
                }
                None => {
                    members.insert(
                        name.clone(),
                        Member {
                            node: node.clone(),
                            addr,
                            last_seen: Instant::now(),
                            confirmed: true,
                        },
                    );
                    true
                }
            };

            // Peers we only know through gossip get contacted, not trusted
            for info in gossip {
                if info.node.node_name == self.node.node_name
                    || members.contains_key(&info.node.node_name)
                {
                    continue;
                }
                tracing::debug!(node = %info.node.node_name, addr = %info.addr, "Learned peer via gossip");
                members.insert(
                    info.node.node_name.clone(),
                    Member {
                        node: info.node,
                        addr: info.addr,
                        last_seen: Instant::now(),
                        confirmed: false,
                    },
                );
            }

            newly_confirmed
        };

        tracing::trace!(node = %node.node_name, "Received heartbeat");

        if newly_confirmed {
            tracing::info!(node = %node, addr = %addr, "Member joined");
            self.publish_member_count().await;

            // Answer immediately so the peer doesn't wait a full interval
            let reply = self.heartbeat_message().await;
            self.send_to(addr, reply).await;

            let caches: Vec<String> = self.handlers.read().await.keys().cloned().collect();
            for cache in caches {
                self.send_to(addr, Message::SyncRequest { cache }).await;
            }
        }
    }
}

/// Highest-random-weight owner selection
fn rendezvous_owner<'a>(key: &[u8], candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    candidates
        .map(|name| {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(name.as_bytes());
            let digest: [u8; 32] = hasher.finalize().into();
            (digest, name)
        })
        .max()
        .map(|(_, name)| name.to_string())
}
