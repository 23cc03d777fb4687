//! Common error types for Warden components.

use thiserror::Error;

/// Convenience alias used by the cache and cluster layers
pub type Result<T> = std::result::Result<T, WardenError>;

/// Common errors across Warden components
#[derive(Debug, Error)]
pub enum WardenError {
    /// Cluster transport could not initialize (e.g. address in use)
    #[error("Cluster bootstrap failed: {0}")]
    ClusterBootstrap(String),

    /// Replica set did not acknowledge a write in time; outcome unknown
    #[error("Replication of {operation} timed out ({acked}/{expected} replicas acknowledged)")]
    ReplicationTimeout {
        operation: String,
        acked: usize,
        expected: usize,
    },

    /// Datagram send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire encoding/decoding failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Operation requires a started cache manager
    #[error("Cache manager not started")]
    NotStarted,

    /// Operation attempted after shutdown
    #[error("Cache manager shut down")]
    ShutDown,

    /// A cache with this name exists with different key/value types
    #[error("Cache type mismatch: {0}")]
    CacheTypeMismatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ClusterBootstrap(_) => 500,
            Self::ReplicationTimeout { .. } => 504,
            Self::Transport(_) => 503,
            Self::Codec(_) => 500,
            Self::NotStarted => 503,
            Self::ShutDown => 503,
            Self::CacheTypeMismatch(_) => 500,
            Self::Config(_) => 500,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    ///
    /// A retried write after `ReplicationTimeout` should be preceded by a
    /// `get`, since the timed-out write may have landed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReplicationTimeout { .. } | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_timeout_is_retryable() {
        let err = WardenError::ReplicationTimeout {
            operation: "put".to_string(),
            acked: 1,
            expected: 2,
        };
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 504);
        assert_eq!(
            err.to_string(),
            "Replication of put timed out (1/2 replicas acknowledged)"
        );
    }

    #[test]
    fn bootstrap_failure_is_fatal() {
        let err = WardenError::ClusterBootstrap("address in use".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), 500);
    }
}
