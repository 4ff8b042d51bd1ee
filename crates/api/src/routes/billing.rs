//! Billing webhook route

use axum::{extract::State, http::HeaderMap, Json};
use liverelay_billing::WebhookOutcome;

use crate::{error::ApiError, state::AppState};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Billing provider webhook
///
/// Unrelated event types are acknowledged with 200 so the provider does not
/// retry them.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookOutcome>, ApiError> {
    tracing::info!(body_len = body.len(), "Billing webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .webhooks
        .handle_webhook(&body, signature)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Billing webhook rejected");
            ApiError::from(e)
        })?;

    Ok(Json(outcome))
}
