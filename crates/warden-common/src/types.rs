//! Core types shared across Warden components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use crate::error::WardenError;

/// Opaque, positive user identifier. Used as the session cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(NonZeroU64);

impl UserId {
    /// Create a UserId, rejecting zero
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn value(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u64 = s
            .parse()
            .map_err(|_| WardenError::InvalidInput(format!("not a user id: {s:?}")))?;
        Self::new(raw).ok_or_else(|| WardenError::InvalidInput("user id must be positive".into()))
    }
}

impl TryFrom<u64> for UserId {
    type Error = WardenError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| WardenError::InvalidInput("user id must be positive".into()))
    }
}

/// Authentication credential/claims bundle stored per user.
///
/// The cache never inspects a session; it is replaced wholesale on `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Authenticated principal name
    pub principal: String,

    /// When the credential was issued
    pub issued_at: DateTime<Utc>,

    /// Free-form claims (roles, client id, token id, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Session {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            issued_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A user as resolved through the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            display_name: None,
            groups: Vec::new(),
        }
    }
}

/// Cluster node identity, fixed for the lifetime of a cache manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node name, unique within the cluster
    pub node_name: String,

    /// Cluster this node belongs to
    pub cluster_name: String,

    /// Host/machine identifier
    pub machine_id: String,
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.node_name, self.cluster_name, self.machine_id)
    }
}

/// Why an entry left a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalCause {
    /// TTL elapsed
    Expired,
    /// Session invalidated (logout, revocation)
    Invalidated,
    /// Entry removed through the raw cache API
    ExplicitRemoval,
}

impl RemovalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Invalidated => "invalidated",
            Self::ExplicitRemoval => "explicit_removal",
        }
    }
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
