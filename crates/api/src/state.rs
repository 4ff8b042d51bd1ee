//! Shared application state

use std::sync::Arc;

use liverelay_billing::{EntitlementGate, EntitlementStore, WebhookVerifier};
use liverelay_shared::BroadcastChannel;
use liverelay_worker::{LiveSource, Normalizer};

use crate::config::Config;
use crate::gateway::{OverlayGateway, RoomManager};
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub entitlements: Arc<EntitlementStore>,
    pub sessions: SessionManager,
    pub gateway: OverlayGateway,
    pub webhooks: Arc<EntitlementGate>,
    pub broadcast: Arc<dyn BroadcastChannel>,
}

impl AppState {
    /// Wire the components together around a broadcast backend and live source
    pub fn new(
        config: Config,
        broadcast: Arc<dyn BroadcastChannel>,
        source: Arc<dyn LiveSource>,
    ) -> Self {
        let entitlements = Arc::new(EntitlementStore::new());
        let rooms = Arc::new(RoomManager::new(config.gateway_queue_bound));

        let sessions = SessionManager::new(
            Arc::clone(&entitlements),
            Arc::clone(&broadcast),
            source,
            Normalizer::new(config.supported_event_kinds.iter().copied()),
            config.adapter_config(),
            Arc::clone(&rooms),
        );
        let gateway = OverlayGateway::new(sessions.clone(), Arc::clone(&broadcast), rooms);

        let mut webhooks = EntitlementGate::new(Arc::clone(&entitlements), Arc::new(sessions.clone()));
        if let Some(secret) = &config.billing_webhook_secret {
            webhooks = webhooks.with_verifier(WebhookVerifier::new(secret, config.webhook_tolerance_secs));
        }

        Self {
            config: Arc::new(config),
            entitlements,
            sessions,
            gateway,
            webhooks: Arc::new(webhooks),
            broadcast,
        }
    }
}
