//! HTTP route handlers for a Warden node.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use warden_common::WardenError;

use crate::state::AppState;

mod health;
mod sessions;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/cluster", get(health::cluster_view))
        .route("/stats", get(health::stats))

        // Session admin
        .route("/sessions", axum::routing::delete(sessions::invalidate_all))
        .route(
            "/sessions/{user_id}",
            put(sessions::put_session)
                .get(sessions::get_session)
                .delete(sessions::invalidate_session),
        )

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

/// Error returned by handlers, rendered as JSON
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                error: message.into(),
                retryable: false,
            },
        }
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %err, "Request failed");
        }
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use warden::config::{AppConfig, UserSeed};

    async fn app() -> (AppState, Router) {
        let mut config = AppConfig::default();
        config.cluster.bind_addr = "127.0.0.1:0".to_string();
        config.cluster.node_name = "node-http".to_string();
        config.users.push(UserSeed {
            id: 5,
            username: "alice".to_string(),
            display_name: None,
            groups: Vec::new(),
        });
        let state = AppState::new(config).await.unwrap();
        (state.clone(), create_router(state))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_lifecycle_over_http() {
        let (state, app) = app().await;

        let (status, _) = send(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "PUT",
            "/sessions/5",
            Some(r#"{"principal":"alice","attributes":{"role":"admin"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["principal"], "alice");

        let (status, body) = send(&app, "GET", "/sessions/5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attributes"]["role"], "admin");

        let (_, body) = send(&app, "DELETE", "/sessions/5", None).await;
        assert_eq!(body["removed"], 1);
        let (_, body) = send(&app, "DELETE", "/sessions/5", None).await;
        assert_eq!(body["removed"], 0);

        let (status, _) = send(&app, "GET", "/sessions/5", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_user_ids_are_rejected() {
        let (state, app) = app().await;

        let (status, body) = send(&app, "GET", "/sessions/0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["retryable"], false);

        let (status, body) = send(&app, "GET", "/cluster", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node"]["node_name"], "node-http");
        assert_eq!(body["join"]["status"], "formed");

        state.manager.shutdown().await;
        let (status, _) = send(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
