//! Ingestion Adapter
//!
//! Runs one upstream connection per broadcast session. Raw events are
//! normalized and published on the session topic in the order they arrive.
//!
//! Reconnects use capped exponential backoff with jitter, so sessions that
//! lost the same upstream do not retry in lockstep. They are only attempted while
//! the owning session is still live; the session state is re-read before
//! every attempt and watched while waiting, so a stop that races a
//! disconnect never produces a new connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use liverelay_shared::{BroadcastChannel, SessionId, SessionState};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, NormalizeError};
use crate::normalizer::Normalizer;
use crate::source::{LiveSource, RawEventStream};

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Delay before the first reconnect attempt
    pub backoff_base: Duration,
    /// Upper bound for any single delay
    pub backoff_max: Duration,
    /// Consecutive failed connects before the adapter gives up
    pub max_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl AdapterConfig {
    /// Delays for one streak of reconnects: `backoff_base` doubling per
    /// attempt up to `backoff_max`; each delay lands at random between half
    /// and all of its step
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.backoff_base.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let max = self.backoff_max;

        std::iter::once(Duration::from_millis(base_ms))
            .chain(ExponentialBackoff::from_millis(2).factor(base_ms).max_delay(max))
            .map(move |delay| delay.min(max))
            .map(|delay| delay / 2 + jitter(delay / 2))
    }
}

/// Progress reports sent to the session supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Connected,
    Disconnected { error: String },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { reason: String },
}

/// Why [`IngestionAdapter::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterExit {
    /// The cancellation token fired
    Cancelled,
    /// The session stopped being live
    SessionLeftActive,
    /// Reconnect attempts were exhausted
    Failed,
}

/// Ingest counters for one session
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    published: AtomicU64,
    dropped_unrecognized: AtomicU64,
    dropped_malformed: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub published: u64,
    pub dropped_unrecognized: u64,
    pub dropped_malformed: u64,
    pub reconnects: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped_unrecognized: self.dropped_unrecognized.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-run inputs owned by the session that spawned the adapter
pub struct AdapterContext {
    pub session_id: SessionId,
    pub source_handle: String,
    pub state: watch::Receiver<SessionState>,
    pub cancel: CancellationToken,
    pub status: mpsc::UnboundedSender<AdapterStatus>,
}

impl AdapterContext {
    fn report(&self, status: AdapterStatus) {
        // Supervisor gone means the session is already torn down
        let _ = self.status.send(status);
    }

    fn session_live(&self) -> bool {
        self.state.borrow().is_live()
    }
}

enum PumpEnd {
    Cancelled,
    LeftActive,
    Disconnected(String),
}

pub struct IngestionAdapter {
    source: Arc<dyn LiveSource>,
    normalizer: Normalizer,
    broadcast: Arc<dyn BroadcastChannel>,
    config: AdapterConfig,
    stats: Arc<IngestStats>,
}

impl IngestionAdapter {
    pub fn new(
        source: Arc<dyn LiveSource>,
        normalizer: Normalizer,
        broadcast: Arc<dyn BroadcastChannel>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            source,
            normalizer,
            broadcast,
            config,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Connect, pump and reconnect until cancelled, the session leaves the
    /// live states, or connecting fails `max_attempts` times in a row
    pub async fn run(&self, mut ctx: AdapterContext) -> AdapterExit {
        let session_id = ctx.session_id;
        let mut failed_connects: u32 = 0;
        let mut attempt: u32 = 0;
        let mut delays = self.config.backoff();

        loop {
            if ctx.cancel.is_cancelled() {
                return AdapterExit::Cancelled;
            }
            if !ctx.session_live() {
                tracing::info!(session_id = %session_id, "Session no longer live, not connecting");
                return AdapterExit::SessionLeftActive;
            }

            let connected = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return AdapterExit::Cancelled,
                result = self.source.connect(&ctx.source_handle) => result,
            };

            match connected {
                Ok(stream) => {
                    failed_connects = 0;
                    attempt = 0;
                    delays = self.config.backoff();
                    tracing::info!(
                        session_id = %session_id,
                        handle = %ctx.source_handle,
                        "Ingestion connected"
                    );
                    ctx.report(AdapterStatus::Connected);

                    match self.pump(&mut ctx, stream).await {
                        PumpEnd::Cancelled => return AdapterExit::Cancelled,
                        PumpEnd::LeftActive => return AdapterExit::SessionLeftActive,
                        PumpEnd::Disconnected(error) => {
                            tracing::warn!(session_id = %session_id, error = %error, "Live source disconnected");
                            ctx.report(AdapterStatus::Disconnected { error });
                        }
                    }
                }
                Err(e) => {
                    failed_connects += 1;
                    tracing::warn!(
                        session_id = %session_id,
                        failed_connects = failed_connects,
                        error = %e,
                        "Live source connect failed"
                    );
                    if failed_connects >= self.config.max_attempts {
                        let reason = format!(
                            "gave up after {} failed connection attempts: {}",
                            failed_connects, e
                        );
                        tracing::error!(session_id = %session_id, reason = %reason, "Ingestion failed");
                        ctx.report(AdapterStatus::Failed { reason });
                        return AdapterExit::Failed;
                    }
                }
            }

            attempt += 1;
            let delay = delays.next().unwrap_or(self.config.backoff_max);
            tracing::info!(
                session_id = %session_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to live source"
            );
            ctx.report(AdapterStatus::Reconnecting { attempt, delay });

            if let Some(exit) = Self::wait(&mut ctx, delay).await {
                return exit;
            }
            IngestStats::bump(&self.stats.reconnects);
        }
    }

    /// Sleep for `delay`, waking early if the session is cancelled or stops
    async fn wait(ctx: &mut AdapterContext, delay: Duration) -> Option<AdapterExit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Some(AdapterExit::Cancelled),
                changed = ctx.state.changed() => {
                    if changed.is_err() || !ctx.session_live() {
                        return Some(AdapterExit::SessionLeftActive);
                    }
                }
                _ = &mut sleep => return None,
            }
        }
    }

    async fn pump(&self, ctx: &mut AdapterContext, mut stream: RawEventStream) -> PumpEnd {
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return PumpEnd::Cancelled,
                changed = ctx.state.changed() => {
                    if changed.is_err() || !ctx.session_live() {
                        return PumpEnd::LeftActive;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(raw)) => self.ingest(ctx.session_id, &raw).await,
                    Some(Err(IngestError::Decode(reason))) => {
                        IngestStats::bump(&self.stats.received);
                        IngestStats::bump(&self.stats.dropped_malformed);
                        tracing::debug!(session_id = %ctx.session_id, reason = %reason, "Dropped undecodable frame");
                    }
                    Some(Err(e)) => return PumpEnd::Disconnected(e.to_string()),
                    None => return PumpEnd::Disconnected("stream ended".to_string()),
                },
            }
        }
    }

    async fn ingest(&self, session_id: SessionId, raw: &serde_json::Value) {
        IngestStats::bump(&self.stats.received);

        match self.normalizer.normalize(raw) {
            Ok(event) => {
                IngestStats::bump(&self.stats.published);
                self.broadcast.publish(session_id, event).await;
            }
            Err(NormalizeError::UnrecognizedEventKind(kind)) => {
                IngestStats::bump(&self.stats.dropped_unrecognized);
                tracing::debug!(session_id = %session_id, kind = %kind, "Dropped unrecognized event");
            }
            Err(e @ NormalizeError::Malformed { .. }) => {
                IngestStats::bump(&self.stats.dropped_malformed);
                tracing::debug!(session_id = %session_id, error = %e, "Dropped malformed event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::ScriptedSource;
    use liverelay_shared::{CanonicalEvent, EventStream, MemoryBroadcast};
    use serde_json::json;

    const HANDLE: &str = "@streamer";

    struct Harness {
        source: Arc<ScriptedSource>,
        broadcast: Arc<MemoryBroadcast>,
        adapter: Arc<IngestionAdapter>,
        state: watch::Sender<SessionState>,
        cancel: CancellationToken,
        session_id: SessionId,
    }

    fn harness(max_attempts: u32) -> Harness {
        let source = Arc::new(ScriptedSource::new());
        let broadcast = Arc::new(MemoryBroadcast::default());
        let config = AdapterConfig {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            max_attempts,
        };
        let adapter = Arc::new(IngestionAdapter::new(
            source.clone(),
            Normalizer::default(),
            broadcast.clone(),
            config,
        ));
        let (state, _) = watch::channel(SessionState::Active);
        Harness {
            source,
            broadcast,
            adapter,
            state,
            cancel: CancellationToken::new(),
            session_id: SessionId::new(),
        }
    }

    impl Harness {
        fn spawn(
            &self,
        ) -> (
            tokio::task::JoinHandle<AdapterExit>,
            mpsc::UnboundedReceiver<AdapterStatus>,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            let ctx = AdapterContext {
                session_id: self.session_id,
                source_handle: HANDLE.to_string(),
                state: self.state.subscribe(),
                cancel: self.cancel.clone(),
                status: tx,
            };
            let adapter = Arc::clone(&self.adapter);
            (tokio::spawn(async move { adapter.run(ctx).await }), rx)
        }

        async fn subscribe(&self) -> EventStream {
            self.broadcast.subscribe(self.session_id).await.unwrap()
        }
    }

    fn comment(user: &str, text: &str) -> serde_json::Value {
        json!({"user": {"nickname": user}, "comment": text})
    }

    async fn next_event(stream: &mut EventStream) -> CanonicalEvent {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<AdapterStatus>) -> AdapterStatus {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed")
    }

    async fn join(handle: tokio::task::JoinHandle<AdapterExit>) -> AdapterExit {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("adapter did not stop")
            .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps_with_jitter() {
        let config = AdapterConfig::default();
        let ceilings = [500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
            .map(Duration::from_millis);

        for _ in 0..20 {
            for (delay, ceiling) in config.backoff().zip(ceilings) {
                assert!(delay <= ceiling, "{:?} above {:?}", delay, ceiling);
                assert!(delay >= ceiling / 2, "{:?} below half of {:?}", delay, ceiling);
            }
        }
        assert!(config.backoff().take(64).all(|d| d <= Duration::from_secs(30)));
    }

    #[test]
    fn test_backoff_is_jittered() {
        let config = AdapterConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(10),
            max_attempts: 8,
        };

        let delays: Vec<Duration> = config.backoff().take(32).collect();
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[tokio::test]
    async fn test_events_published_in_arrival_order() {
        let h = harness(3);
        let feed = h.source.push_connection(HANDLE);
        let mut events = h.subscribe().await;
        let (task, mut status) = h.spawn();

        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);
        for text in ["e1", "e2", "e3"] {
            feed.send(Ok(comment("alice", text))).unwrap();
        }

        for expected in ["e1", "e2", "e3"] {
            assert_eq!(next_event(&mut events).await.text(), Some(expected));
        }

        h.cancel.cancel();
        assert_eq!(join(task).await, AdapterExit::Cancelled);
    }

    #[tokio::test]
    async fn test_bad_events_are_counted_not_fatal() {
        let h = harness(3);
        let feed = h.source.push_connection(HANDLE);
        let mut events = h.subscribe().await;
        let (task, mut status) = h.spawn();
        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);

        feed.send(Ok(json!({"type": "follow", "user": "carol"}))).unwrap();
        feed.send(Ok(json!({"user": "bob", "gift": {"name": "Rose", "repeat_count": 0}})))
            .unwrap();
        feed.send(Err(IngestError::Decode("garbage".into()))).unwrap();
        feed.send(Ok(comment("alice", "still here"))).unwrap();

        assert_eq!(next_event(&mut events).await.text(), Some("still here"));

        let stats = h.adapter.stats().snapshot();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dropped_unrecognized, 1);
        assert_eq!(stats.dropped_malformed, 2);

        h.cancel.cancel();
        join(task).await;
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect_while_active() {
        let h = harness(3);
        let first = h.source.push_connection(HANDLE);
        let second = h.source.push_connection(HANDLE);
        let mut events = h.subscribe().await;
        let (task, mut status) = h.spawn();

        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);
        first.send(Ok(comment("alice", "before"))).unwrap();
        assert_eq!(next_event(&mut events).await.text(), Some("before"));
        drop(first);

        assert!(matches!(
            next_status(&mut status).await,
            AdapterStatus::Disconnected { .. }
        ));
        assert!(matches!(
            next_status(&mut status).await,
            AdapterStatus::Reconnecting { attempt: 1, delay } if delay <= Duration::from_millis(1)
        ));
        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);

        second.send(Ok(comment("alice", "after"))).unwrap();
        assert_eq!(next_event(&mut events).await.text(), Some("after"));
        assert_eq!(h.source.attempts(HANDLE), 2);
        assert_eq!(h.adapter.stats().snapshot().reconnects, 1);

        h.cancel.cancel();
        join(task).await;
    }

    #[tokio::test]
    async fn test_no_reconnect_after_session_stops() {
        let h = harness(3);
        let feed = h.source.push_connection(HANDLE);
        let _spare = h.source.push_connection(HANDLE);
        let (task, mut status) = h.spawn();
        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);

        // Stop lands before the upstream drops
        h.state.send_replace(SessionState::Stopping);
        drop(feed);

        assert_eq!(join(task).await, AdapterExit::SessionLeftActive);
        assert_eq!(h.source.attempts(HANDLE), 1);
    }

    #[tokio::test]
    async fn test_stop_during_backoff_prevents_reconnect() {
        let h = harness(3);
        h.source.push_failure(HANDLE);
        let _spare = h.source.push_connection(HANDLE);
        let adapter = Arc::new(IngestionAdapter::new(
            h.source.clone(),
            Normalizer::default(),
            h.broadcast.clone(),
            AdapterConfig {
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(10),
                max_attempts: 3,
            },
        ));
        let (tx, mut status) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            session_id: h.session_id,
            source_handle: HANDLE.to_string(),
            state: h.state.subscribe(),
            cancel: h.cancel.clone(),
            status: tx,
        };
        let task = tokio::spawn(async move { adapter.run(ctx).await });

        assert!(matches!(
            next_status(&mut status).await,
            AdapterStatus::Reconnecting { attempt: 1, .. }
        ));
        h.state.send_replace(SessionState::Stopping);

        assert_eq!(join(task).await, AdapterExit::SessionLeftActive);
        assert_eq!(h.source.attempts(HANDLE), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let h = harness(3);
        let (task, mut status) = h.spawn();

        assert_eq!(join(task).await, AdapterExit::Failed);
        assert_eq!(h.source.attempts(HANDLE), 3);

        let mut last = None;
        while let Ok(s) = status.try_recv() {
            last = Some(s);
        }
        assert!(matches!(last, Some(AdapterStatus::Failed { .. })));
    }

    #[tokio::test]
    async fn test_successful_connect_resets_failure_count() {
        let h = harness(2);
        h.source.push_failure(HANDLE);
        let feed = h.source.push_connection(HANDLE);
        let (task, mut status) = h.spawn();

        assert!(matches!(
            next_status(&mut status).await,
            AdapterStatus::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(next_status(&mut status).await, AdapterStatus::Connected);

        // One more failure after a disconnect is still below the limit
        h.source.push_failure(HANDLE);
        let _last = h.source.push_connection(HANDLE);
        drop(feed);

        loop {
            if next_status(&mut status).await == AdapterStatus::Connected {
                break;
            }
        }
        assert_eq!(h.source.attempts(HANDLE), 4);

        h.cancel.cancel();
        assert_eq!(join(task).await, AdapterExit::Cancelled);
    }

    #[tokio::test]
    async fn test_not_started_when_session_already_stopped() {
        let h = harness(3);
        h.state.send_replace(SessionState::Inactive);
        let (task, _status) = h.spawn();

        assert_eq!(join(task).await, AdapterExit::SessionLeftActive);
        assert_eq!(h.source.attempts(HANDLE), 0);
    }
}
