//! # Warden
//!
//! Clustered authentication-session cache with cluster-wide invalidation
//! and logout fan-out.
//!
//! ## Architecture
//! ```text
//! AuthenticationSessionCache → ReplicatedCache ⇄ ClusterTransport (UDP) ⇄ peers
//!              ↓ removal events
//!        LogoutNotifier → UserDirectory + AuthenticationListeners
//! ```

pub mod auth;
pub mod cache;
pub mod cluster;
pub mod config;
