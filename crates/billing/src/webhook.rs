//! Entitlement Gate
//!
//! Consumes billing-provider webhooks and turns the two event types this
//! system cares about into entitlement updates:
//!
//! - `entitlement.granted` → user may start sessions
//! - `entitlement.revoked` → user may not, and any running session is stopped
//!
//! Every other event type is acknowledged and ignored. Payload shape is
//! validated before any record is touched.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use liverelay_shared::UserId;
use serde::Serialize;
use serde_json::Value;

use crate::entitlement::{EntitlementChange, EntitlementStore};
use crate::error::{BillingError, BillingResult};
use crate::signature::WebhookVerifier;

pub const ENTITLEMENT_GRANTED: &str = "entitlement.granted";
pub const ENTITLEMENT_REVOKED: &str = "entitlement.revoked";

/// How many event ids are remembered for duplicate suppression
const RECENT_EVENT_WINDOW: usize = 1024;

/// Notified when a user loses entitlement
#[async_trait]
pub trait RevocationListener: Send + Sync {
    /// Must be idempotent: revocations can be delivered more than once
    async fn on_entitlement_revoked(&self, user_id: &UserId);
}

/// Result of handling one webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        user_id: UserId,
        change: EntitlementChange,
    },
    Ignored {
        event_type: String,
    },
    Duplicate {
        event_id: String,
    },
}

/// A validated, recognized entitlement event
#[derive(Debug)]
struct EntitlementEvent {
    id: Option<String>,
    user_id: UserId,
    entitled: bool,
    occurred_at: DateTime<Utc>,
}

/// Bounded set of recently handled event ids
#[derive(Debug, Default)]
struct RecentEvents {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentEvents {
    /// Returns false if `id` was already recorded
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= RECENT_EVENT_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Applies billing webhooks to the entitlement store
pub struct EntitlementGate {
    store: Arc<EntitlementStore>,
    listener: Arc<dyn RevocationListener>,
    verifier: Option<WebhookVerifier>,
    recent: Mutex<RecentEvents>,
}

impl EntitlementGate {
    pub fn new(store: Arc<EntitlementStore>, listener: Arc<dyn RevocationListener>) -> Self {
        Self {
            store,
            listener,
            verifier: None,
            recent: Mutex::new(RecentEvents::default()),
        }
    }

    /// Require signed webhooks
    pub fn with_verifier(mut self, verifier: WebhookVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Handle one webhook body exactly as received
    pub async fn handle_webhook(
        &self,
        body: &str,
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        if let Some(verifier) = &self.verifier {
            verifier.verify(body, signature, Utc::now().timestamp())?;
        }

        let payload: Value = serde_json::from_str(body)?;
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidPayload("missing string field 'type'".into()))?;

        let entitled = match event_type {
            ENTITLEMENT_GRANTED => true,
            ENTITLEMENT_REVOKED => false,
            other => {
                tracing::debug!(event_type = %other, "Ignoring unrelated billing event");
                return Ok(WebhookOutcome::Ignored {
                    event_type: other.to_string(),
                });
            }
        };

        let event = parse_entitlement_event(&payload, entitled)?;

        if let Some(id) = &event.id {
            let fresh = match self.recent.lock() {
                Ok(mut recent) => recent.insert(id),
                // A poisoned window only loses duplicate suppression
                Err(poisoned) => poisoned.into_inner().insert(id),
            };
            if !fresh {
                tracing::info!(event_id = %id, "Duplicate billing webhook ignored");
                return Ok(WebhookOutcome::Duplicate {
                    event_id: id.clone(),
                });
            }
        }

        let change = self
            .store
            .apply(&event.user_id, event.entitled, event.occurred_at)
            .await;

        if !event.entitled && change != EntitlementChange::Stale {
            self.listener.on_entitlement_revoked(&event.user_id).await;
        }

        tracing::info!(
            event_type = %event_type,
            user_id = %event.user_id,
            change = ?change,
            "Billing webhook applied"
        );

        Ok(WebhookOutcome::Applied {
            user_id: event.user_id,
            change,
        })
    }
}

fn parse_entitlement_event(payload: &Value, entitled: bool) -> BillingResult<EntitlementEvent> {
    let user_id = payload
        .get("user_id")
        .and_then(Value::as_str)
        .and_then(UserId::parse)
        .ok_or_else(|| BillingError::InvalidPayload("missing or empty 'user_id'".into()))?;

    let id = match payload.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(_) => return Err(BillingError::InvalidPayload("'id' must be a string".into())),
    };

    let occurred_at = match payload.get("created") {
        None | Some(Value::Null) => Utc::now(),
        Some(value) => value
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| {
                BillingError::InvalidPayload("'created' must be unix seconds".into())
            })?,
    };

    Ok(EntitlementEvent {
        id,
        user_id,
        entitled,
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingListener {
        revoked: AsyncMutex<Vec<UserId>>,
    }

    #[async_trait]
    impl RevocationListener for RecordingListener {
        async fn on_entitlement_revoked(&self, user_id: &UserId) {
            self.revoked.lock().await.push(user_id.clone());
        }
    }

    fn gate() -> (EntitlementGate, Arc<EntitlementStore>, Arc<RecordingListener>) {
        let store = Arc::new(EntitlementStore::new());
        let listener = Arc::new(RecordingListener::default());
        let gate = EntitlementGate::new(Arc::clone(&store), listener.clone());
        (gate, store, listener)
    }

    fn u1() -> UserId {
        UserId::parse("u1").unwrap()
    }

    #[tokio::test]
    async fn test_granted_webhook_entitles_user() {
        let (gate, store, _) = gate();

        let outcome = gate
            .handle_webhook(r#"{"type":"entitlement.granted","user_id":"u1"}"#, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                user_id: u1(),
                change: EntitlementChange::Granted
            }
        );
        assert!(store.get(&u1()).await.unwrap().entitled);
    }

    #[tokio::test]
    async fn test_revoked_webhook_notifies_listener() {
        let (gate, store, listener) = gate();

        gate.handle_webhook(r#"{"type":"entitlement.granted","user_id":"u1"}"#, None)
            .await
            .unwrap();
        gate.handle_webhook(r#"{"type":"entitlement.revoked","user_id":"u1"}"#, None)
            .await
            .unwrap();

        assert!(!store.is_entitled(&u1()).await);
        assert_eq!(*listener.revoked.lock().await, vec![u1()]);
    }

    #[tokio::test]
    async fn test_repeated_revocation_is_delivered_again() {
        let (gate, _, listener) = gate();
        let body = r#"{"type":"entitlement.revoked","user_id":"u1"}"#;

        gate.handle_webhook(body, None).await.unwrap();
        gate.handle_webhook(body, None).await.unwrap();

        assert_eq!(listener.revoked.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unrecognized_type_is_acknowledged() {
        let (gate, store, _) = gate();

        let outcome = gate
            .handle_webhook(r#"{"type":"invoice.paid","customer":"cus_1"}"#, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                event_type: "invoice.paid".into()
            }
        );
        assert!(store.get(&u1()).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_payloads_rejected_without_mutation() {
        let (gate, store, listener) = gate();

        for body in [
            "not json",
            "[]",
            r#"{"user_id":"u1"}"#,
            r#"{"type":42,"user_id":"u1"}"#,
            r#"{"type":"entitlement.granted"}"#,
            r#"{"type":"entitlement.granted","user_id":""}"#,
            r#"{"type":"entitlement.revoked","user_id":7}"#,
            r#"{"type":"entitlement.granted","user_id":"u1","created":"yesterday"}"#,
            r#"{"type":"entitlement.granted","user_id":"u1","id":5}"#,
        ] {
            let result = gate.handle_webhook(body, None).await;
            assert!(
                matches!(result, Err(BillingError::InvalidPayload(_))),
                "body {:?} should be rejected, got {:?}",
                body,
                result
            );
        }

        assert!(store.get(&u1()).await.is_none());
        assert!(listener.revoked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_applied_once() {
        let (gate, _, listener) = gate();
        let body = r#"{"id":"evt_1","type":"entitlement.revoked","user_id":"u1"}"#;

        gate.handle_webhook(body, None).await.unwrap();
        let second = gate.handle_webhook(body, None).await.unwrap();

        assert_eq!(
            second,
            WebhookOutcome::Duplicate {
                event_id: "evt_1".into()
            }
        );
        assert_eq!(listener.revoked.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_grant_does_not_override_revocation() {
        let (gate, store, _) = gate();

        gate.handle_webhook(
            r#"{"type":"entitlement.revoked","user_id":"u1","created":2000}"#,
            None,
        )
        .await
        .unwrap();
        let outcome = gate
            .handle_webhook(
                r#"{"type":"entitlement.granted","user_id":"u1","created":1000}"#,
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                user_id: u1(),
                change: EntitlementChange::Stale
            }
        );
        assert!(!store.is_entitled(&u1()).await);
    }

    #[tokio::test]
    async fn test_signed_gate_rejects_unsigned_payload() {
        let (gate, store, _) = gate();
        let gate = gate.with_verifier(WebhookVerifier::new("whsec_test", 300));
        let body = r#"{"type":"entitlement.granted","user_id":"u1"}"#;

        let result = gate.handle_webhook(body, None).await;
        assert!(matches!(result, Err(BillingError::WebhookSignatureMissing)));
        assert!(store.get(&u1()).await.is_none());

        let now = Utc::now().timestamp();
        let header = format!(
            "t={},v1={}",
            now,
            WebhookVerifier::new("whsec_test", 300).sign(body, now)
        );
        gate.handle_webhook(body, Some(&header)).await.unwrap();
        assert!(store.is_entitled(&u1()).await);
    }

    #[test]
    fn test_recent_window_evicts_oldest() {
        let mut recent = RecentEvents::default();
        for i in 0..RECENT_EVENT_WINDOW {
            assert!(recent.insert(&format!("evt_{}", i)));
        }
        assert!(!recent.insert("evt_0"));

        assert!(recent.insert("evt_new"));
        // evt_0 fell out of the window
        assert!(recent.insert("evt_0"));
    }
}
