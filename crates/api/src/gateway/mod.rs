//! Overlay Gateway
//!
//! Accepts persistent overlay connections and relays a session's broadcast
//! events to each of them.
//!
//! # Architecture
//!
//! - **Queue**: bounded per-connection outbound queue, drop-oldest on overflow
//! - **Connection**: one client subscription and its forwarder task
//! - **Room**: all subscriptions of a session, closed together on stop
//! - **Handler**: Axum WebSocket route handler
//! - **Events**: server-to-client message definitions

pub mod connection;
pub mod events;
pub mod handler;
pub mod queue;
pub mod room;

use std::sync::Arc;

use liverelay_shared::{BroadcastChannel, SessionId, SessionState, UserId};
use uuid::Uuid;

pub use connection::ClientSubscription;
pub use events::{CloseReason, ServerMessage};
pub use handler::overlay_ws;
pub use room::{GatewayStats, RoomManager};

use crate::error::GatewayError;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct OverlayGateway {
    sessions: SessionManager,
    broadcast: Arc<dyn BroadcastChannel>,
    rooms: Arc<RoomManager>,
}

impl OverlayGateway {
    pub fn new(
        sessions: SessionManager,
        broadcast: Arc<dyn BroadcastChannel>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            sessions,
            broadcast,
            rooms,
        }
    }

    /// Subscribe a client to an active session
    ///
    /// The viewer is allowed when `identity` owns the session or `token`
    /// matches its overlay token.
    pub async fn accept(
        &self,
        session_id: SessionId,
        identity: Option<&UserId>,
        token: Option<&str>,
    ) -> Result<ClientSubscription, GatewayError> {
        let guard = self
            .sessions
            .lock_session(session_id)
            .await
            .ok_or(GatewayError::SessionNotActive)?;
        let session = guard.session().ok_or(GatewayError::SessionNotActive)?;

        if !session.permits_viewer(identity, token) {
            tracing::warn!(
                session_id = %session_id,
                identity = ?identity.map(UserId::as_str),
                "Overlay accept refused: unauthorized"
            );
            return Err(GatewayError::Unauthorized);
        }
        if session.state != SessionState::Active {
            return Err(GatewayError::SessionNotActive);
        }

        let events = self
            .broadcast
            .subscribe(session_id)
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let subscription = self.rooms.join(session_id, events).await;
        drop(guard);

        tracing::info!(
            session_id = %session_id,
            subscription_id = %subscription.subscription_id,
            "Overlay connected"
        );
        Ok(subscription)
    }

    /// Tear down one subscription after its connection went away
    pub async fn disconnect(&self, session_id: SessionId, subscription_id: Uuid) {
        self.rooms.leave(&session_id, &subscription_id).await;
        tracing::info!(
            session_id = %session_id,
            subscription_id = %subscription_id,
            "Overlay disconnected"
        );
    }

    /// Room counts; `dropped_events` covers both queue overflow and events a
    /// lagging subscription skipped on the broadcast topic
    pub async fn stats(&self) -> GatewayStats {
        let mut stats = self.rooms.stats().await;
        stats.dropped_events += self.broadcast.skipped_events();
        stats
    }
}
