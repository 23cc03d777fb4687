//! Cluster coordination modules.
//!
//! Implements:
//! - Membership gossip and acknowledged replication (UDP)
//! - Write versioning (Lamport clock)
//! - Cache manager lifecycle

mod clock;
mod manager;
mod transport;
pub mod wire;

pub use clock::{LamportClock, Version};
pub use manager::{ClusterCacheManager, JoinStatus};
pub use transport::{ClusterTransport, ReplicaHandler, Replication};
pub use wire::MemberInfo;
