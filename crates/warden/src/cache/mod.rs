//! Replicated caches.
//!
//! - Near-cache (bounded local copies of recent reads)
//! - Replicated cache with TTL, versioned writes and removal events

mod near;
mod replicated;

pub(crate) use replicated::ManagedCache;
pub use near::NearCache;
pub use replicated::{
    CacheKey, CacheStats, CacheValue, RemovalEvent, RemovalListener, ReplicatedCache,
};
