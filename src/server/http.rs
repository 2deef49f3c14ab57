//! HTTP handlers

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::server::auth::Claims;
use crate::server::ServerState;
use crate::session::SessionSummary;

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub dialect: String,
    pub default_mode: String,
    pub active_sessions: usize,
    pub auth_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Server status
pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let response = StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dialect: format!("{:?}", state.config.realtime.dialect).to_lowercase(),
        default_mode: state.config.capture.mode.to_string(),
        active_sessions: state.sessions.registry().len().await,
        auth_enabled: true,
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Live sessions of the caller; `admin` tokens see every session
pub async fn sessions_handler(
    State(state): State<ServerState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let registry = state.sessions.registry();
    let sessions = if claims.permissions.iter().any(|p| p == "admin") {
        registry.list().await
    } else {
        registry.list_for_owner(&claims.sub).await
    };

    (StatusCode::OK, Json(SessionsResponse { sessions })).into_response()
}
