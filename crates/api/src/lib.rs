//! LiveRelay API Library
//!
//! Session control, billing webhooks and the overlay WebSocket gateway.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod session;
pub mod state;

pub use config::{BroadcastBackend, Config};
pub use error::{ApiError, ApiResult, GatewayError, SessionError};
pub use gateway::OverlayGateway;
pub use session::SessionManager;
pub use state::AppState;
