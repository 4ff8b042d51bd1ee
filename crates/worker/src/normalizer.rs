//! Event Normalizer
//!
//! Maps raw live-source payloads onto the closed [`CanonicalEvent`] schema.
//! Adding a new event kind means adding an [`EventKind`] variant and a match
//! arm in [`Normalizer::normalize_at`]; there is no handler registration.
//!
//! Two raw shapes are accepted for each kind:
//!
//! ```text
//! {"user":{"nickname":"alice"},"comment":"hi"}
//! {"type":"comment","user":"alice","text":"hi"}
//!
//! {"user":{"nickname":"bob"},"gift":{"name":"Rose","repeat_count":3}}
//! {"type":"gift","user":"bob","gift":"Rose","count":3}
//! ```
//!
//! An optional `create_time` (unix milliseconds) becomes the source
//! timestamp; otherwise the receive time is used.

use std::collections::HashSet;
use std::num::NonZeroU32;

use chrono::{DateTime, TimeZone, Utc};
use liverelay_shared::{CanonicalEvent, EventKind};
use serde_json::{Map, Value};

use crate::error::NormalizeError;

/// Pure mapping from raw source payloads to canonical events
#[derive(Debug, Clone)]
pub struct Normalizer {
    supported: HashSet<EventKind>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(EventKind::ALL)
    }
}

impl Normalizer {
    /// Only `supported` kinds are produced; the rest are rejected as unrecognized
    pub fn new(supported: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    pub fn supports(&self, kind: EventKind) -> bool {
        self.supported.contains(&kind)
    }

    pub fn normalize(&self, raw: &Value) -> Result<CanonicalEvent, NormalizeError> {
        self.normalize_at(raw, Utc::now())
    }

    /// Normalize with an explicit receive time
    pub fn normalize_at(
        &self,
        raw: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<CanonicalEvent, NormalizeError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| NormalizeError::UnrecognizedEventKind("<non-object>".into()))?;

        let kind = detect_kind(obj)?;
        if !self.supports(kind) {
            return Err(NormalizeError::UnrecognizedEventKind(kind.to_string()));
        }

        let name = display_name(obj).ok_or_else(|| malformed(kind, "missing user display name"))?;
        let timestamp = source_timestamp(obj, kind)?.unwrap_or(received_at);

        match kind {
            EventKind::Comment => {
                let text = obj
                    .get("comment")
                    .or_else(|| obj.get("text"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "missing comment text"))?;
                Ok(CanonicalEvent::comment(name, text, timestamp))
            }
            EventKind::Gift => {
                let (gift_name, count) = gift_fields(obj)?;
                Ok(CanonicalEvent::gift(name, gift_name, count, timestamp))
            }
        }
    }
}

fn malformed(kind: EventKind, reason: &str) -> NormalizeError {
    NormalizeError::Malformed {
        kind,
        reason: reason.to_string(),
    }
}

fn detect_kind(obj: &Map<String, Value>) -> Result<EventKind, NormalizeError> {
    if let Some(tag) = obj.get("type") {
        let tag = tag
            .as_str()
            .ok_or_else(|| NormalizeError::UnrecognizedEventKind(tag.to_string()))?;
        return tag
            .parse()
            .map_err(|_| NormalizeError::UnrecognizedEventKind(tag.to_string()));
    }

    if obj.contains_key("comment") {
        Ok(EventKind::Comment)
    } else if obj.contains_key("gift") {
        Ok(EventKind::Gift)
    } else {
        Err(NormalizeError::UnrecognizedEventKind("<untagged>".into()))
    }
}

fn display_name(obj: &Map<String, Value>) -> Option<&str> {
    let name = match obj.get("user")? {
        Value::String(name) => name.as_str(),
        Value::Object(user) => user
            .get("nickname")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .or_else(|| user.get("unique_id").and_then(Value::as_str))?,
        _ => return None,
    };
    Some(name).filter(|n| !n.trim().is_empty())
}

fn source_timestamp(
    obj: &Map<String, Value>,
    kind: EventKind,
) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    match obj.get("create_time") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Some)
            .ok_or_else(|| malformed(kind, "create_time must be unix milliseconds")),
    }
}

fn gift_fields(obj: &Map<String, Value>) -> Result<(&str, NonZeroU32), NormalizeError> {
    let kind = EventKind::Gift;
    let (name, count) = match obj.get("gift") {
        Some(Value::Object(gift)) => (gift.get("name"), gift.get("repeat_count")),
        Some(name @ Value::String(_)) => (Some(name), obj.get("count")),
        _ => return Err(malformed(kind, "missing gift")),
    };

    let name = name
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| malformed(kind, "missing gift name"))?;

    let count = count
        .ok_or_else(|| malformed(kind, "missing repeat count"))?
        .as_i64()
        .ok_or_else(|| malformed(kind, "repeat count must be an integer"))?;

    // Counts below one are rejected rather than clamped
    let count = u32::try_from(count)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| malformed(kind, "repeat count must be at least 1"))?;

    Ok((name, count))
}
