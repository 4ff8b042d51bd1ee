//! Session Manager
//!
//! Owns every broadcast session. State changes for one user are serialized
//! by that user's slot mutex; different users never contend. A session's
//! ingestion adapter runs in its own task and reports back through
//! [`SessionManager::mark_active`] and [`SessionManager::fail_session`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use liverelay_billing::{EntitlementStore, RevocationListener};
use liverelay_shared::{BroadcastChannel, SessionId, SessionState, UserId};
use liverelay_worker::{
    AdapterConfig, AdapterContext, AdapterExit, AdapterStatus, IngestStats, IngestionAdapter,
    LiveSource, Normalizer,
};
use rand::RngCore;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use super::model::{BroadcastSession, SessionView, StartedSession};
use crate::error::SessionError;
use crate::gateway::{CloseReason, RoomManager};

/// Runtime resources of a live session
struct SessionHandle {
    session: BroadcastSession,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
}

impl SessionHandle {
    fn set_state(&mut self, next: SessionState) {
        if !self.session.state.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.session.session_id,
                from = %self.session.state,
                to = %next,
                "Forced session state transition"
            );
        }
        self.session.state = next;
        self.state_tx.send_replace(next);
    }
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

/// Exclusive access to one session, held while attaching an overlay
pub struct SessionGuard {
    slot: OwnedMutexGuard<Option<SessionHandle>>,
    session_id: SessionId,
}

impl SessionGuard {
    /// The session, if it still exists under this id
    pub fn session(&self) -> Option<&BroadcastSession> {
        self.slot
            .as_ref()
            .filter(|h| h.session.session_id == self.session_id)
            .map(|h| &h.session)
    }
}

struct Inner {
    slots: RwLock<HashMap<UserId, Slot>>,
    /// session_id -> owner, for lookups that only know the session
    index: RwLock<HashMap<SessionId, UserId>>,
    entitlements: Arc<EntitlementStore>,
    broadcast: Arc<dyn BroadcastChannel>,
    source: Arc<dyn LiveSource>,
    normalizer: Normalizer,
    adapter_config: AdapterConfig,
    rooms: Arc<RoomManager>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        entitlements: Arc<EntitlementStore>,
        broadcast: Arc<dyn BroadcastChannel>,
        source: Arc<dyn LiveSource>,
        normalizer: Normalizer,
        adapter_config: AdapterConfig,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                index: RwLock::new(HashMap::new()),
                entitlements,
                broadcast,
                source,
                normalizer,
                adapter_config,
                rooms,
            }),
        }
    }

    async fn slot(&self, user_id: &UserId) -> Slot {
        if let Some(slot) = self.inner.slots.read().await.get(user_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.inner.slots.write().await;
        Arc::clone(slots.entry(user_id.clone()).or_default())
    }

    async fn existing_slot(&self, user_id: &UserId) -> Option<Slot> {
        self.inner.slots.read().await.get(user_id).cloned()
    }

    /// Forget an emptied slot unless another caller still holds it
    ///
    /// Must be called with the slot locked and empty. Slots are only handed
    /// out under the `slots` lock, so the count cannot grow while it is held.
    async fn prune_slot(&self, user_id: &UserId, slot: &Slot) {
        let mut slots = self.inner.slots.write().await;
        let ours = slots.get(user_id).is_some_and(|s| Arc::ptr_eq(s, slot));
        // One reference in the map and one held by the caller
        if ours && Arc::strong_count(slot) == 2 {
            slots.remove(user_id);
        }
    }

    async fn owner_of(&self, session_id: SessionId) -> Option<UserId> {
        self.inner.index.read().await.get(&session_id).cloned()
    }

    /// Start a session for `user_id`
    ///
    /// Returns while the session is still `Starting`; it becomes `Active`
    /// once the ingestion adapter confirms the upstream connection.
    pub async fn start(
        &self,
        user_id: &UserId,
        source_handle: Option<String>,
    ) -> Result<StartedSession, SessionError> {
        let slot = self.slot(user_id).await;
        let mut guard = slot.lock().await;

        if guard.as_ref().is_some_and(|h| h.session.state.is_live()) {
            return Err(SessionError::AlreadyActive);
        }
        if !self.inner.entitlements.is_entitled(user_id).await {
            tracing::info!(user_id = %user_id, "Session start refused: not entitled");
            if guard.is_none() {
                self.prune_slot(user_id, &slot).await;
            }
            return Err(SessionError::NotEntitled);
        }

        let session = BroadcastSession {
            session_id: SessionId::new(),
            user_id: user_id.clone(),
            source_handle: source_handle
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| user_id.to_string()),
            state: SessionState::Starting,
            started_at: Utc::now(),
            entitlement_token: mint_token(),
        };
        let session_id = session.session_id;

        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let adapter = IngestionAdapter::new(
            Arc::clone(&self.inner.source),
            self.inner.normalizer.clone(),
            Arc::clone(&self.inner.broadcast),
            self.inner.adapter_config.clone(),
        );
        let ctx = AdapterContext {
            session_id,
            source_handle: session.source_handle.clone(),
            state: state_rx,
            cancel: cancel.clone(),
            status: status_tx,
        };

        let started = StartedSession {
            session_id,
            state: session.state,
            started_at: session.started_at,
            overlay_token: session.entitlement_token.clone(),
        };

        self.inner
            .index
            .write()
            .await
            .insert(session_id, user_id.clone());
        *guard = Some(SessionHandle {
            stats: adapter.stats(),
            session,
            state_tx,
            cancel,
        });
        drop(guard);

        tokio::spawn(self.clone().supervise(session_id, adapter, ctx, status_rx));

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            "Session starting"
        );
        Ok(started)
    }

    /// Stop the user's session, closing overlays with `session_ended`
    pub async fn stop(&self, user_id: &UserId) -> Result<(), SessionError> {
        let slot = self
            .existing_slot(user_id)
            .await
            .ok_or(SessionError::NoActiveSession)?;
        let mut guard = slot.lock().await;

        if !guard.as_ref().is_some_and(|h| h.session.state.is_live()) {
            return Err(SessionError::NoActiveSession);
        }
        self.terminate(&mut guard, CloseReason::SessionEnded).await;
        self.prune_slot(user_id, &slot).await;
        Ok(())
    }

    /// Stop the user's session, if any, closing overlays with
    /// `entitlement_revoked`; returns whether a session was stopped
    pub async fn on_entitlement_revoked(&self, user_id: &UserId) -> bool {
        let Some(slot) = self.existing_slot(user_id).await else {
            return false;
        };
        let mut guard = slot.lock().await;

        if !guard.as_ref().is_some_and(|h| h.session.state.is_live()) {
            return false;
        }
        tracing::info!(user_id = %user_id, "Entitlement revoked, stopping session");
        self.terminate(&mut guard, CloseReason::EntitlementRevoked).await;
        self.prune_slot(user_id, &slot).await;
        true
    }

    /// Stop every live session whose owner is no longer entitled
    pub async fn reconcile_entitlements(&self) -> usize {
        let owners: Vec<UserId> = self.inner.index.read().await.values().cloned().collect();

        let mut stopped = 0;
        for user_id in owners {
            if !self.inner.entitlements.is_entitled(&user_id).await
                && self.on_entitlement_revoked(&user_id).await
            {
                stopped += 1;
            }
        }
        if stopped > 0 {
            tracing::info!(stopped = stopped, "Entitlement sweep stopped sessions");
        }
        stopped
    }

    /// `Starting → Active` once the upstream connection is confirmed
    pub async fn mark_active(&self, session_id: SessionId) {
        let Some(user_id) = self.owner_of(session_id).await else {
            return;
        };
        let Some(slot) = self.existing_slot(&user_id).await else {
            return;
        };
        let mut guard = slot.lock().await;

        if let Some(handle) = guard
            .as_mut()
            .filter(|h| h.session.session_id == session_id)
        {
            if handle.session.state == SessionState::Starting {
                handle.set_state(SessionState::Active);
                tracing::info!(
                    user_id = %user_id,
                    session_id = %session_id,
                    "Session active"
                );
            }
        }
    }

    /// Abnormal path: the adapter gave up, so the session goes straight to
    /// `Inactive` and overlays are closed with `source_failed`
    pub async fn fail_session(&self, session_id: SessionId) {
        let Some(user_id) = self.owner_of(session_id).await else {
            return;
        };
        let Some(slot) = self.existing_slot(&user_id).await else {
            return;
        };
        let mut guard = slot.lock().await;

        let matches = guard
            .as_ref()
            .is_some_and(|h| h.session.session_id == session_id && h.session.state.is_live());
        if !matches {
            return;
        }
        let Some(mut handle) = guard.take() else {
            return;
        };

        tracing::error!(
            user_id = %user_id,
            session_id = %session_id,
            from = %handle.session.state,
            "Ingestion failed, force-terminating session"
        );
        handle.set_state(SessionState::Inactive);
        self.release(handle, CloseReason::SourceFailed).await;
        self.prune_slot(&user_id, &slot).await;
    }

    /// `→ Stopping → Inactive`, releasing everything the session owns
    async fn terminate(&self, slot: &mut Option<SessionHandle>, reason: CloseReason) {
        let Some(mut handle) = slot.take() else {
            return;
        };
        handle.set_state(SessionState::Stopping);
        let handle = self.release(handle, reason).await;
        tracing::info!(
            user_id = %handle.session.user_id,
            session_id = %handle.session.session_id,
            reason = %reason,
            "Session stopped"
        );
    }

    async fn release(&self, mut handle: SessionHandle, reason: CloseReason) -> SessionHandle {
        let session_id = handle.session.session_id;

        handle.cancel.cancel();
        self.inner.rooms.close_room(&session_id, reason).await;
        self.inner.broadcast.close(session_id).await;

        if handle.session.state != SessionState::Inactive {
            handle.set_state(SessionState::Inactive);
        }
        self.inner.index.write().await.remove(&session_id);
        handle
    }

    async fn supervise(
        self,
        session_id: SessionId,
        adapter: IngestionAdapter,
        ctx: AdapterContext,
        mut status_rx: mpsc::UnboundedReceiver<AdapterStatus>,
    ) {
        let run = adapter.run(ctx);
        tokio::pin!(run);

        let exit = loop {
            tokio::select! {
                exit = &mut run => break exit,
                Some(status) = status_rx.recv() => self.on_adapter_status(session_id, status).await,
            }
        };
        while let Ok(status) = status_rx.try_recv() {
            self.on_adapter_status(session_id, status).await;
        }

        tracing::debug!(session_id = %session_id, exit = ?exit, "Ingestion adapter exited");
        if exit == AdapterExit::Failed {
            self.fail_session(session_id).await;
        }
    }

    async fn on_adapter_status(&self, session_id: SessionId, status: AdapterStatus) {
        match status {
            AdapterStatus::Connected => self.mark_active(session_id).await,
            AdapterStatus::Disconnected { .. } | AdapterStatus::Reconnecting { .. } => {}
            // Handled once the adapter task returns
            AdapterStatus::Failed { .. } => {}
        }
    }

    /// Lock the session for an overlay attach
    ///
    /// While the guard is held the session cannot be stopped, so a
    /// subscription registered under it is always closed by the stop.
    pub async fn lock_session(&self, session_id: SessionId) -> Option<SessionGuard> {
        let user_id = self.owner_of(session_id).await?;
        let slot = self.existing_slot(&user_id).await?;
        Some(SessionGuard {
            slot: slot.lock_owned().await,
            session_id,
        })
    }

    /// The user's current session with its counters
    pub async fn current(&self, user_id: &UserId) -> Option<SessionView> {
        let slot = self.existing_slot(user_id).await?;
        let guard = slot.lock().await;
        let handle = guard.as_ref()?;

        Some(SessionView {
            session_id: handle.session.session_id,
            user_id: handle.session.user_id.clone(),
            source_handle: handle.session.source_handle.clone(),
            state: handle.session.state,
            started_at: handle.session.started_at,
            ingest: handle.stats.snapshot(),
            overlay_connections: self.inner.rooms.room_size(&handle.session.session_id).await,
        })
    }

    pub async fn live_sessions(&self) -> usize {
        self.inner.index.read().await.len()
    }

    /// Stop every session; used on shutdown
    pub async fn stop_all(&self) {
        let owners: Vec<UserId> = self.inner.index.read().await.values().cloned().collect();
        for user_id in owners {
            // Already stopped by a concurrent request
            let _ = self.stop(&user_id).await;
        }
    }
}

#[async_trait]
impl RevocationListener for SessionManager {
    async fn on_entitlement_revoked(&self, user_id: &UserId) {
        SessionManager::on_entitlement_revoked(self, user_id).await;
    }
}

/// Random 32-byte overlay token, hex encoded
fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
