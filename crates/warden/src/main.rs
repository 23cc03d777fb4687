//! # Warden node
//!
//! Runs one member of a Warden cluster: joins the cluster, opens the
//! authentication session cache and serves a small admin HTTP surface.
//!
//! ## Architecture
//! ```text
//! HTTP admin → AuthenticationSessionCache → ReplicatedCache
//!                                               ⇅ UDP
//!                                          other Warden nodes
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod routes;
mod state;

use state::AppState;
use warden::config::{AppConfig, ConfigOverrides};

/// Warden - clustered authentication-session cache
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/warden.toml")]
    config: String,

    /// Cluster transport bind address (overrides config)
    #[arg(long, env = "WARDEN_BIND_ADDR")]
    bind: Option<String>,

    /// Comma-separated seed peers (overrides config)
    #[arg(long, env = "WARDEN_SEEDS", value_delimiter = ',')]
    seeds: Option<Vec<String>>,

    /// Node name (overrides config)
    #[arg(long, env = "WARDEN_NODE_NAME")]
    node_name: Option<String>,

    /// Members to wait for at startup, self included (overrides config)
    #[arg(long, env = "WARDEN_INITIAL_CLUSTER_SIZE")]
    initial_cluster_size: Option<usize>,

    /// HTTP listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_addr: self.bind.clone(),
            seeds: self.seeds.clone(),
            node_name: self.node_name.clone(),
            listen_addr: self.listen.clone(),
            initial_cluster_size: self.initial_cluster_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🛡️ Starting Warden v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!(
        node = %config.cluster.node_name,
        cluster = %config.cluster.cluster_name,
        "📋 Configuration loaded from {}",
        args.config
    );

    // Join the cluster and open the session cache
    let state = AppState::new(config.clone()).await?;
    info!(join = ?state.join_status, "✅ Session cache ready");

    // Build router
    let app = routes::create_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 Warden listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    state.manager.shutdown().await;

    info!("👋 Warden shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to install JSON subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_thread_names(true))
            .try_init()
            .context("Failed to install subscriber")?;
    }

    Ok(())
}
