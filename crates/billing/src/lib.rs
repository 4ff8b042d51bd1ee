//! LiveRelay billing integration
//!
//! Tracks which users are entitled to start a broadcast session and turns
//! billing-provider webhooks into entitlement changes.

pub mod entitlement;
pub mod error;
pub mod signature;
pub mod webhook;

pub use entitlement::{EntitlementChange, EntitlementRecord, EntitlementStore};
pub use error::{BillingError, BillingResult};
pub use signature::WebhookVerifier;
pub use webhook::{EntitlementGate, RevocationListener, WebhookOutcome};
