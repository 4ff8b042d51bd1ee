//! Overlay statistics route

use axum::{extract::State, Json};

use crate::{gateway::GatewayStats, state::AppState};

pub async fn stats(State(state): State<AppState>) -> Json<GatewayStats> {
    Json(state.gateway.stats().await)
}
