//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use liverelay_billing::BillingError;
use serde_json::json;

use crate::gateway::CloseReason;

/// Session control failures, surfaced synchronously to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("User is not entitled to broadcast")]
    NotEntitled,
    #[error("A session is already starting or active for this user")]
    AlreadyActive,
    #[error("No active session")]
    NoActiveSession,
}

/// Overlay accept failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Session is not active")]
    SessionNotActive,
    #[error("Not permitted to view this overlay")]
    Unauthorized,
    #[error("Broadcast channel unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Close reason sent to a client whose accept failed
    pub fn close_reason(&self) -> CloseReason {
        match self {
            GatewayError::Unauthorized => CloseReason::Unauthorized,
            GatewayError::SessionNotActive | GatewayError::Unavailable(_) => {
                CloseReason::SessionNotActive
            }
        }
    }
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Resource errors
    #[error("No active session")]
    NoCurrentSession,

    // Session errors
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", msg.clone()),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string()),

            // Resources
            ApiError::NoCurrentSession => (StatusCode::NOT_FOUND, "NO_ACTIVE_SESSION", self.to_string()),

            // Sessions
            ApiError::Session(SessionError::NotEntitled) => (StatusCode::PAYMENT_REQUIRED, "NOT_ENTITLED", self.to_string()),
            ApiError::Session(SessionError::AlreadyActive) => (StatusCode::CONFLICT, "ALREADY_ACTIVE", self.to_string()),
            ApiError::Session(SessionError::NoActiveSession) => (StatusCode::CONFLICT, "NO_ACTIVE_SESSION", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidPayload(msg) => ApiError::InvalidPayload(msg),
            BillingError::WebhookSignatureMissing
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookTimestampOutOfTolerance { .. } => {
                tracing::warn!(error = %err, "Rejected billing webhook signature");
                ApiError::InvalidSignature
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
