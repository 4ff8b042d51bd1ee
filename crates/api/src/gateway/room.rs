//! Session room management
//!
//! Tracks the overlay subscriptions of every session so a session stop can
//! close all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use liverelay_shared::{EventStream, SessionId};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::{self, ClientSubscription, SubscriberHandle};
use super::events::CloseReason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub active_subscriptions: usize,
    pub rooms: usize,
    pub dropped_events: u64,
}

/// Manages session "rooms" of overlay subscriptions
pub struct RoomManager {
    /// Map of session_id -> subscriptions
    rooms: RwLock<HashMap<SessionId, Vec<Arc<SubscriberHandle>>>>,
    queue_bound: usize,
    /// Drops from subscriptions that have already left
    retired_drops: AtomicU64,
}

impl RoomManager {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            queue_bound,
            retired_drops: AtomicU64::new(0),
        }
    }

    /// Add a subscription fed by `events` to the session room
    pub async fn join(&self, session_id: SessionId, events: EventStream) -> ClientSubscription {
        let (handle, subscription) = connection::subscribe(session_id, events, self.queue_bound);

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(session_id).or_default();
        room.push(handle);

        tracing::debug!(
            session_id = %session_id,
            subscription_id = %subscription.subscription_id,
            room_size = room.len(),
            "Overlay joined session room"
        );

        subscription
    }

    /// Remove one subscription; the session is unaffected
    pub async fn leave(&self, session_id: &SessionId, subscription_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };

        if let Some(pos) = room.iter().position(|h| h.subscription_id == *subscription_id) {
            let handle = room.swap_remove(pos);
            handle.detach();
            self.retired_drops.fetch_add(handle.dropped(), Ordering::Relaxed);
        }

        // Clean up empty rooms
        if room.is_empty() {
            rooms.remove(session_id);
            tracing::debug!(session_id = %session_id, "Removed empty session room");
        } else {
            tracing::debug!(
                session_id = %session_id,
                subscription_id = %subscription_id,
                room_size = room.len(),
                "Overlay left session room"
            );
        }
    }

    /// Close every subscription of a session with `reason`
    ///
    /// Returns the number of subscriptions closed.
    pub async fn close_room(&self, session_id: &SessionId, reason: CloseReason) -> usize {
        let handles = self.rooms.write().await.remove(session_id).unwrap_or_default();

        for handle in &handles {
            handle.close(reason);
            self.retired_drops.fetch_add(handle.dropped(), Ordering::Relaxed);
        }

        if !handles.is_empty() {
            tracing::info!(
                session_id = %session_id,
                reason = %reason,
                closed = handles.len(),
                "Closed overlay subscriptions"
            );
        }
        handles.len()
    }

    /// Get room size (number of subscriptions) for a session
    pub async fn room_size(&self, session_id: &SessionId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(session_id).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn stats(&self) -> GatewayStats {
        let rooms = self.rooms.read().await;
        let live_drops: u64 = rooms.values().flatten().map(|h| h.dropped()).sum();
        GatewayStats {
            active_subscriptions: rooms.values().map(Vec::len).sum(),
            rooms: rooms.len(),
            dropped_events: self.retired_drops.load(Ordering::Relaxed) + live_drops,
        }
    }
}
