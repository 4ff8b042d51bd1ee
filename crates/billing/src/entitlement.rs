//! Entitlement Module
//!
//! Answers the question "may this user start a broadcast session right now?".
//! Records are only written by the webhook gate; the session manager reads
//! them when a session starts and when it reconciles running sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use liverelay_shared::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Entitlement of a single user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub user_id: UserId,
    pub entitled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Effect of applying a billing update to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementChange {
    /// User was not entitled and now is
    Granted,
    /// User was entitled and now is not
    Revoked,
    /// Update matched the current state
    Unchanged,
    /// Update is older than the stored record and was not applied
    Stale,
}

/// In-memory entitlement table
#[derive(Debug, Default)]
pub struct EntitlementStore {
    records: RwLock<HashMap<UserId, EntitlementRecord>>,
}

impl EntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: &UserId) -> Option<EntitlementRecord> {
        self.records.read().await.get(user_id).cloned()
    }

    /// Users without a record are not entitled
    pub async fn is_entitled(&self, user_id: &UserId) -> bool {
        self.records
            .read()
            .await
            .get(user_id)
            .map(|r| r.entitled)
            .unwrap_or(false)
    }

    /// Record the entitlement of `user_id` as of `at`
    ///
    /// Updates older than the stored `updated_at` are reported as
    /// [`EntitlementChange::Stale`] and leave the record untouched, so a
    /// delayed "granted" cannot undo a later "revoked".
    pub async fn apply(
        &self,
        user_id: &UserId,
        entitled: bool,
        at: DateTime<Utc>,
    ) -> EntitlementChange {
        let mut records = self.records.write().await;

        let previous = match records.get(user_id) {
            Some(record) if record.updated_at > at => {
                tracing::info!(
                    user_id = %user_id,
                    stored_at = %record.updated_at,
                    update_at = %at,
                    "Ignoring stale entitlement update"
                );
                return EntitlementChange::Stale;
            }
            Some(record) => record.entitled,
            None => false,
        };

        records.insert(
            user_id.clone(),
            EntitlementRecord {
                user_id: user_id.clone(),
                entitled,
                updated_at: at,
            },
        );

        let change = match (previous, entitled) {
            (false, true) => EntitlementChange::Granted,
            (true, false) => EntitlementChange::Revoked,
            _ => EntitlementChange::Unchanged,
        };

        tracing::info!(
            user_id = %user_id,
            entitled = entitled,
            change = ?change,
            "Entitlement updated"
        );

        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_entitled() {
        let store = EntitlementStore::new();
        assert!(!store.is_entitled(&user("nobody")).await);
        assert!(store.get(&user("nobody")).await.is_none());
    }

    #[tokio::test]
    async fn test_grant_then_revoke() {
        let store = EntitlementStore::new();
        let u1 = user("u1");
        let now = Utc::now();

        assert_eq!(store.apply(&u1, true, now).await, EntitlementChange::Granted);
        assert!(store.is_entitled(&u1).await);

        assert_eq!(
            store.apply(&u1, true, now + Duration::seconds(1)).await,
            EntitlementChange::Unchanged
        );

        assert_eq!(
            store.apply(&u1, false, now + Duration::seconds(2)).await,
            EntitlementChange::Revoked
        );
        assert!(!store.is_entitled(&u1).await);
    }

    #[tokio::test]
    async fn test_stale_update_is_ignored() {
        let store = EntitlementStore::new();
        let u1 = user("u1");
        let now = Utc::now();

        store.apply(&u1, false, now).await;
        let change = store.apply(&u1, true, now - Duration::minutes(5)).await;

        assert_eq!(change, EntitlementChange::Stale);
        assert!(!store.is_entitled(&u1).await);
        assert_eq!(store.get(&u1).await.unwrap().updated_at, now);
    }
}
