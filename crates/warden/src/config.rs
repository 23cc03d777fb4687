//! Configuration management for Warden.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use warden_common::ClusterNode;
use warden_common::constants::*;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address for the admin surface
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Cluster membership/transport configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Cache behaviour
    #[serde(default)]
    pub cache: CacheConfig,

    /// Users known to the in-memory directory
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

/// Cluster transport configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// This node's unique name (auto-generated if not set)
    #[serde(default = "generate_node_name")]
    pub node_name: String,

    /// Machine identifier (hostname if available)
    #[serde(default = "default_machine_id")]
    pub machine_id: String,

    /// UDP bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Seed peers contacted at startup
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Members (self included) to wait for before serving
    #[serde(default = "default_initial_cluster_size")]
    pub initial_cluster_size: usize,

    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_member_timeout")]
    pub member_timeout_ms: u64,

    /// Resend interval for unacknowledged replication
    #[serde(default = "default_retransmit_interval")]
    pub retransmit_interval_ms: u64,
}

impl ClusterConfig {
    pub fn node(&self) -> ClusterNode {
        ClusterNode {
            node_name: self.node_name.clone(),
            cluster_name: self.cluster_name.clone(),
            machine_id: self.machine_id.clone(),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.member_timeout_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            node_name: generate_node_name(),
            machine_id: default_machine_id(),
            bind_addr: default_bind_addr(),
            seeds: Vec::new(),
            initial_cluster_size: default_initial_cluster_size(),
            join_timeout_secs: default_join_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            member_timeout_ms: default_member_timeout(),
            retransmit_interval_ms: default_retransmit_interval(),
        }
    }
}

/// Replicated cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to authentication sessions
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Near-cache entry lifespan (0 disables the near-cache)
    #[serde(default = "default_near_cache_lifespan")]
    pub near_cache_lifespan_ms: u64,

    #[serde(default = "default_near_cache_max_entries")]
    pub near_cache_max_entries: usize,

    /// Bound on waiting for replica acknowledgements
    #[serde(default = "default_replication_timeout")]
    pub replication_timeout_ms: u64,

    /// Bound on a remote owner read
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,

    /// Retention of removal tombstones
    #[serde(default = "default_tombstone_ttl")]
    pub tombstone_ttl_ms: u64,
}

impl CacheConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn near_cache_lifespan(&self) -> Duration {
        Duration::from_millis(self.near_cache_lifespan_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            near_cache_lifespan_ms: default_near_cache_lifespan(),
            near_cache_max_entries: default_near_cache_max_entries(),
            replication_timeout_ms: default_replication_timeout(),
            fetch_timeout_ms: default_fetch_timeout(),
            reaper_interval_ms: default_reaper_interval(),
            tombstone_ttl_ms: default_tombstone_ttl(),
        }
    }
}

/// A user entry for the in-memory directory
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Command-line overrides applied on top of the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_addr: Option<String>,
    pub seeds: Option<Vec<String>>,
    pub node_name: Option<String>,
    pub listen_addr: Option<String>,
    pub initial_cluster_size: Option<usize>,
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_cluster_name() -> String { DEFAULT_CLUSTER_NAME.to_string() }
fn default_bind_addr() -> String { DEFAULT_BIND_ADDR.to_string() }
fn default_initial_cluster_size() -> usize { DEFAULT_INITIAL_CLUSTER_SIZE }
fn default_join_timeout() -> u64 { DEFAULT_JOIN_TIMEOUT_SECS }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_MS }
fn default_member_timeout() -> u64 { DEFAULT_MEMBER_TIMEOUT_MS }
fn default_retransmit_interval() -> u64 { DEFAULT_RETRANSMIT_INTERVAL_MS }
fn default_session_ttl() -> u64 { DEFAULT_SESSION_TTL_SECS }
fn default_near_cache_lifespan() -> u64 { DEFAULT_NEAR_CACHE_LIFESPAN_MS }
fn default_near_cache_max_entries() -> usize { DEFAULT_NEAR_CACHE_MAX_ENTRIES }
fn default_replication_timeout() -> u64 { DEFAULT_REPLICATION_TIMEOUT_MS }
fn default_fetch_timeout() -> u64 { DEFAULT_FETCH_TIMEOUT_MS }
fn default_reaper_interval() -> u64 { DEFAULT_REAPER_INTERVAL_MS }
fn default_tombstone_ttl() -> u64 { DEFAULT_TOMBSTONE_TTL_MS }

fn generate_node_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

fn default_machine_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            use rand::Rng;
            format!("machine-{:08x}", rand::rng().random::<u32>())
        })
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        if !Path::new(config_path).exists() {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        // Missing file still picks up defaults and environment overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.seeds")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config file")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        config.apply(overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref bind) = overrides.bind_addr {
            self.cluster.bind_addr = bind.clone();
        }
        if let Some(ref seeds) = overrides.seeds {
            self.cluster.seeds = seeds.clone();
        }
        if let Some(ref name) = overrides.node_name {
            self.cluster.node_name = name.clone();
        }
        if let Some(ref listen) = overrides.listen_addr {
            self.listen_addr = listen.clone();
        }
        if let Some(size) = overrides.initial_cluster_size {
            self.cluster.initial_cluster_size = size;
        }
    }

    /// Reject settings the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster.node_name.is_empty() {
            anyhow::bail!("cluster.node_name must not be empty");
        }
        if self.cluster.initial_cluster_size == 0 {
            anyhow::bail!("cluster.initial_cluster_size must be at least 1");
        }
        if self.cache.session_ttl_secs == 0 {
            anyhow::bail!("cache.session_ttl_secs must be positive");
        }
        if self.cache.replication_timeout_ms == 0 {
            anyhow::bail!("cache.replication_timeout_ms must be positive");
        }
        if let Some(user) = self.users.iter().find(|u| u.id == 0) {
            anyhow::bail!("user {:?} has id 0; user ids must be positive", user.username);
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            cluster: ClusterConfig::default(),
            cache: CacheConfig::default(),
            users: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = AppConfig::default();
        assert_eq!(config.cluster.cluster_name, DEFAULT_CLUSTER_NAME);
        assert_eq!(config.cache.near_cache_lifespan(), Duration::from_millis(5_000));
        assert_eq!(config.cluster.join_timeout(), Duration::from_secs(30));
        assert!(config.cluster.node_name.starts_with("node-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = AppConfig::default();
        config.apply(&ConfigOverrides {
            bind_addr: Some("127.0.0.1:9000".to_string()),
            seeds: Some(vec!["127.0.0.1:9001".to_string()]),
            node_name: Some("node-a".to_string()),
            listen_addr: None,
            initial_cluster_size: Some(2),
        });
        assert_eq!(config.cluster.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.cluster.seeds, vec!["127.0.0.1:9001".to_string()]);
        assert_eq!(config.cluster.node_name, "node-a");
        assert_eq!(config.cluster.initial_cluster_size, 2);
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
    }

    #[test]
    fn zero_cluster_size_is_rejected() {
        let mut config = AppConfig::default();
        config.cluster.initial_cluster_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load("does/not/exist.toml", &ConfigOverrides::default()).unwrap();
        assert_eq!(config.cache.session_ttl_secs, DEFAULT_SESSION_TTL_SECS);
    }
}
