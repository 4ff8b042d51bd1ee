//! Overlay wire messages
//!
//! Every frame sent to an overlay client is one JSON text message tagged by
//! `type`. Clients send nothing the gateway acts on.

use liverelay_shared::{CanonicalEvent, SessionId};
use serde::Serialize;
use uuid::Uuid;

/// Why an overlay connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The owner stopped the session
    SessionEnded,
    /// The owner lost entitlement
    EntitlementRevoked,
    /// The live source could not be reached
    SourceFailed,
    /// Accept rejected: caller may not view this overlay
    Unauthorized,
    /// Accept rejected: session not active
    SessionNotActive,
}

impl CloseReason {
    /// WebSocket close code (application range)
    pub fn code(self) -> u16 {
        match self {
            CloseReason::SessionEnded => 4000,
            CloseReason::EntitlementRevoked => 4001,
            CloseReason::SourceFailed => 4002,
            CloseReason::Unauthorized => 4003,
            CloseReason::SessionNotActive => 4004,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::SessionEnded => "session_ended",
            CloseReason::EntitlementRevoked => "entitlement_revoked",
            CloseReason::SourceFailed => "source_failed",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::SessionNotActive => "session_not_active",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted
    Connected {
        subscription_id: Uuid,
        session_id: SessionId,
    },

    /// One live event
    Event(CanonicalEvent),

    /// Final message before the close frame
    Closed { reason: CloseReason },
}

impl ServerMessage {
    pub fn is_event(&self) -> bool {
        matches!(self, ServerMessage::Event(_))
    }
}
