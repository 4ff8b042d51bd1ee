//! Common types used across LiveRelay

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
///
/// Identities are resolved by the upstream auth layer and arrive as opaque
/// strings, so no format is imposed beyond being non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Build a user id, rejecting empty or whitespace-only values
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == raw.len() {
            Some(Self(raw))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast session ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a broadcast session
///
/// The only legal path is `Inactive → Starting → Active → Stopping → Inactive`.
/// `Starting → Stopping` is also legal (stop requested before the upstream
/// connection was confirmed). Any other jump is a forced termination and must
/// go through the session manager's abnormal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl SessionState {
    /// Whether the session still owns an ingestion adapter
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }

    /// Whether `next` is a regular (non-forced) transition from `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Inactive, Starting)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Stopping, Inactive)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Canonical Events
// =============================================================================

/// Kinds of live events the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Comment,
    Gift,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Comment, EventKind::Gift];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Comment => "comment",
            EventKind::Gift => "gift",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comment" => Ok(EventKind::Comment),
            "gift" => Ok(EventKind::Gift),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// Kind-specific payload of a canonical event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    /// Chat comment
    Comment { text: String },

    /// Gift sent to the broadcaster, `gift_count` times in a row
    Gift {
        gift_name: String,
        gift_count: NonZeroU32,
    },
}

/// Normalized, source-agnostic live event
///
/// Serialized for overlay clients as
/// `{"display_name":..,"timestamp":..,"kind":"comment","text":..}` or
/// `{"display_name":..,"timestamp":..,"kind":"gift","gift_name":..,"gift_count":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    #[serde(rename = "display_name")]
    user_display_name: String,
    #[serde(rename = "timestamp")]
    source_timestamp: DateTime<Utc>,
    #[serde(flatten)]
    body: EventBody,
}

impl CanonicalEvent {
    pub fn comment(
        display_name: impl Into<String>,
        text: impl Into<String>,
        source_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_display_name: display_name.into(),
            source_timestamp,
            body: EventBody::Comment { text: text.into() },
        }
    }

    pub fn gift(
        display_name: impl Into<String>,
        gift_name: impl Into<String>,
        gift_count: NonZeroU32,
        source_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_display_name: display_name.into(),
            source_timestamp,
            body: EventBody::Gift {
                gift_name: gift_name.into(),
                gift_count,
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Comment { .. } => EventKind::Comment,
            EventBody::Gift { .. } => EventKind::Gift,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.user_display_name
    }

    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.source_timestamp
    }

    pub fn body(&self) -> &EventBody {
        &self.body
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            EventBody::Comment { text } => Some(text),
            EventBody::Gift { .. } => None,
        }
    }

    pub fn gift_name(&self) -> Option<&str> {
        match &self.body {
            EventBody::Gift { gift_name, .. } => Some(gift_name),
            EventBody::Comment { .. } => None,
        }
    }

    pub fn gift_count(&self) -> Option<u32> {
        match &self.body {
            EventBody::Gift { gift_count, .. } => Some(gift_count.get()),
            EventBody::Comment { .. } => None,
        }
    }
}
