//! Ingestion error types

use liverelay_shared::EventKind;
use thiserror::Error;

/// Errors from the upstream live-chat connection
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Connection to live source failed: {0}")]
    ConnectionFailed(String),

    #[error("Live source disconnected: {0}")]
    Disconnected(String),

    #[error("Undecodable frame from live source: {0}")]
    Decode(String),
}

/// Reasons a raw event cannot be normalized
///
/// Both variants are dropped and counted by the adapter; neither stops it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("Unrecognized event kind: {0}")]
    UnrecognizedEventKind(String),

    #[error("Malformed {kind} event: {reason}")]
    Malformed { kind: EventKind, reason: String },
}
