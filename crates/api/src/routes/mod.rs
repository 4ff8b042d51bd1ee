//! API routes

pub mod billing;
pub mod health;
pub mod overlay;
pub mod sessions;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{gateway::overlay_ws, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Session control (identity from the upstream auth layer)
    let session_routes = Router::new()
        .route("/sessions/start", post(sessions::start_session))
        .route("/sessions/stop", post(sessions::stop_session))
        .route("/sessions/current", get(sessions::current_session));

    // Billing provider webhook (optionally signed)
    let billing_routes = Router::new().route("/billing/webhook", post(billing::webhook));

    // Overlay stream
    let overlay_routes = Router::new()
        .route("/overlay/ws", get(overlay_ws))
        .route("/overlay/stats", get(overlay::stats));

    Router::new()
        .merge(health_routes)
        .merge(session_routes)
        .merge(billing_routes)
        .merge(overlay_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
