//! Shared constants for Warden components.

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "warden";

/// Default cluster transport bind address (UDP)
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7800";

/// Default HTTP listen address for the node's admin surface
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8890";

/// Number of members (self included) to wait for at startup
pub const DEFAULT_INITIAL_CLUSTER_SIZE: usize = 1;

/// How long startup waits for the initial cluster to form (seconds)
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 30;

/// Heartbeat/gossip interval (milliseconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Member is dropped from the view after this much silence (milliseconds)
pub const DEFAULT_MEMBER_TIMEOUT_MS: u64 = 5_000;

/// Default session lifetime (30 minutes)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 1_800;

/// Near-cache entry lifespan (milliseconds)
pub const DEFAULT_NEAR_CACHE_LIFESPAN_MS: u64 = 5_000;

/// Near-cache capacity per cache
pub const DEFAULT_NEAR_CACHE_MAX_ENTRIES: usize = 10_000;

/// Bound on waiting for replica acknowledgements (milliseconds)
pub const DEFAULT_REPLICATION_TIMEOUT_MS: u64 = 15_000;

/// Resend interval for unacknowledged replication messages (milliseconds)
pub const DEFAULT_RETRANSMIT_INTERVAL_MS: u64 = 200;

/// Bound on a remote owner fetch before falling back to the local replica (milliseconds)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 500;

/// Reaper tick (milliseconds)
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 50;

/// How long removal tombstones are retained (milliseconds)
pub const DEFAULT_TOMBSTONE_TTL_MS: u64 = 60_000;

/// Largest datagram the cluster transport will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Well-known cache names
pub mod cache_names {
    /// Authentication sessions keyed by user id
    pub const AUTH_SESSIONS: &str = "auth-sessions";
}

/// Property keys attached to logout notifications
pub mod logout_properties {
    /// Removal cause (`expired`, `invalidated`, `explicit_removal`)
    pub const CAUSE: &str = "logout.cause";

    /// Node that originated the removal
    pub const ORIGIN: &str = "logout.origin";

    /// Principal recorded in the removed session
    pub const PRINCIPAL: &str = "session.principal";
}
