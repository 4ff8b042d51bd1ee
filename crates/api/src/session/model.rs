//! Session data types

use chrono::{DateTime, Utc};
use liverelay_shared::{SessionId, SessionState, UserId};
use liverelay_worker::IngestStatsSnapshot;
use serde::Serialize;
use subtle::ConstantTimeEq;

/// One broadcast session
#[derive(Debug, Clone)]
pub struct BroadcastSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub source_handle: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Bearer token that lets a header-less overlay client view this session
    pub entitlement_token: String,
}

impl BroadcastSession {
    /// Whether `identity` or `token` may view this session's overlay
    pub fn permits_viewer(&self, identity: Option<&UserId>, token: Option<&str>) -> bool {
        if identity == Some(&self.user_id) {
            return true;
        }
        token
            .map(|t| bool::from(t.as_bytes().ct_eq(self.entitlement_token.as_bytes())))
            .unwrap_or(false)
    }
}

/// Returned to the caller of a successful start
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub overlay_token: String,
}

/// Current session with its runtime counters
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub source_handle: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ingest: IngestStatsSnapshot,
    pub overlay_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> BroadcastSession {
        BroadcastSession {
            session_id: SessionId::new(),
            user_id: UserId::parse("u1").unwrap(),
            source_handle: "@u1".into(),
            state: SessionState::Active,
            started_at: Utc::now(),
            entitlement_token: "abc123".into(),
        }
    }

    #[test]
    fn test_owner_may_view() {
        let s = session();
        assert!(s.permits_viewer(Some(&UserId::parse("u1").unwrap()), None));
    }

    #[test]
    fn test_token_holder_may_view() {
        let s = session();
        assert!(s.permits_viewer(None, Some("abc123")));
        assert!(s.permits_viewer(Some(&UserId::parse("u2").unwrap()), Some("abc123")));
    }

    #[test]
    fn test_others_may_not_view() {
        let s = session();
        assert!(!s.permits_viewer(None, None));
        assert!(!s.permits_viewer(Some(&UserId::parse("u2").unwrap()), None));
        assert!(!s.permits_viewer(None, Some("abc12")));
        assert!(!s.permits_viewer(None, Some("")));
    }
}
