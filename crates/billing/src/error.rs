//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Webhook signature header missing")]
    WebhookSignatureMissing,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook timestamp outside tolerance ({skew_secs}s skew)")]
    WebhookTimestampOutOfTolerance { skew_secs: i64 },
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidPayload(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
