//! Health, readiness and cluster status endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use warden::cache::CacheStats;
use warden::cluster::{JoinStatus, MemberInfo};
use warden_common::ClusterNode;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    standalone: bool,
}

/// Readiness check (is the cache manager running?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if !state.manager.is_running().await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(ReadyResponse {
        status: "ready",
        standalone: state.manager.is_standalone().await,
    }))
}

#[derive(Serialize)]
pub struct ClusterResponse {
    node: ClusterNode,
    transport_addr: Option<String>,
    join: JoinStatus,
    members: Vec<MemberInfo>,
}

/// This node and the members it currently sees
pub async fn cluster_view(State(state): State<AppState>) -> Json<ClusterResponse> {
    Json(ClusterResponse {
        node: state.manager.node(),
        transport_addr: state.manager.local_addr().await.map(|a| a.to_string()),
        join: state.join_status,
        members: state.manager.members().await,
    })
}

#[derive(Serialize)]
pub struct StatsResponse {
    node_name: String,
    uptime_secs: u64,
    session_ttl_secs: u64,
    listeners: usize,
    sessions: CacheStats,
}

/// Session cache counters
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_name: state.config.cluster.node_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        session_ttl_secs: state.sessions.ttl().as_secs(),
        listeners: state.notifier.listener_count(),
        sessions: state.sessions.stats(),
    })
}
