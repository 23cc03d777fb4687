//! Session admin endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use warden::auth::Properties;
use warden_common::{Session, UserId};

use super::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PutSessionRequest {
    principal: String,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct RemovedResponse {
    removed: usize,
}

fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    raw.parse::<UserId>().map_err(ApiError::from)
}

/// Store a session and announce the login
pub async fn put_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<PutSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let mut session = Session::new(request.principal);
    if let Some(issued_at) = request.issued_at {
        session.issued_at = issued_at;
    }
    session.attributes = request.attributes;

    state.sessions.put(user_id, session.clone()).await?;

    let properties: Properties = session
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    state.notifier.notify_login(user_id, &properties);

    Ok(Json(session))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    match state.sessions.get(user_id).await? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::not_found(format!("no session for user {user_id}"))),
    }
}

/// Invalidate one session; absent sessions report zero removed
pub async fn invalidate_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<RemovedResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let removed = usize::from(state.sessions.invalidate(user_id).await?);
    Ok(Json(RemovedResponse { removed }))
}

pub async fn invalidate_all(
    State(state): State<AppState>,
) -> Result<Json<RemovedResponse>, ApiError> {
    let removed = state.sessions.invalidate_all().await?;
    Ok(Json(RemovedResponse { removed }))
}
