//! Session control routes

use axum::{body::Bytes, extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthenticatedUser,
    error::{ApiError, ApiResult},
    session::{SessionView, StartedSession},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Live-source account to relay; defaults to the caller's user id
    pub source_handle: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub status: &'static str,
}

/// Start the caller's broadcast session
///
/// The body is optional; an empty body starts with the default handle.
pub async fn start_session(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    body: Bytes,
) -> ApiResult<Json<StartedSession>> {
    let request: StartSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let started = state.sessions.start(&user_id, request.source_handle).await?;
    Ok(Json(started))
}

/// Stop the caller's broadcast session
pub async fn stop_session(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<Json<StopSessionResponse>> {
    state.sessions.stop(&user_id).await?;
    Ok(Json(StopSessionResponse { status: "stopped" }))
}

/// The caller's current session with ingest counters
pub async fn current_session(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<Json<SessionView>> {
    state
        .sessions
        .current(&user_id)
        .await
        .map(Json)
        .ok_or(ApiError::NoCurrentSession)
}
