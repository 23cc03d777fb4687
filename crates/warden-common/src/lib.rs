//! # Warden Common
//!
//! Shared types, errors, and constants used across Warden components.
//!
//! ## Modules
//! - `types` - Core data structures (UserId, Session, ClusterNode, etc.)
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Result, WardenError};
pub use types::*;
