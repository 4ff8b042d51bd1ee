//! In-memory broadcast channel for single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BroadcastChannel, EventStream};
use crate::error::BroadcastError;
use crate::types::{CanonicalEvent, SessionId};

/// Default ring size per topic
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Topic {
    sender: broadcast::Sender<CanonicalEvent>,
    closed: CancellationToken,
}

/// In-memory pub/sub backed by one `tokio::sync::broadcast` ring per topic
///
/// A subscriber that falls more than `capacity` events behind skips the
/// overwritten events instead of slowing the publisher down.
pub struct MemoryBroadcast {
    /// Session ID → topic
    topics: RwLock<HashMap<SessionId, Topic>>,
    capacity: usize,
    skipped: Arc<AtomicU64>,
}

impl MemoryBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of open topics
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

impl Default for MemoryBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

#[async_trait]
impl BroadcastChannel for MemoryBroadcast {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn skipped_events(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    async fn publish(&self, session_id: SessionId, event: CanonicalEvent) {
        let topics = self.topics.read().await;
        match topics.get(&session_id) {
            Some(topic) => {
                // Err only means there are no receivers right now
                let _ = topic.sender.send(event);
            }
            None => {
                tracing::trace!(session_id = %session_id, "Publish to topic with no subscribers");
            }
        }
    }

    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream, BroadcastError> {
        let (rx, closed) = {
            let mut topics = self.topics.write().await;
            let topic = topics.entry(session_id).or_insert_with(|| Topic {
                sender: broadcast::channel(self.capacity).0,
                closed: CancellationToken::new(),
            });
            (topic.sender.subscribe(), topic.closed.clone())
        };
        let state = (rx, closed, Arc::clone(&self.skipped));

        let stream = futures::stream::unfold(state, move |(mut rx, closed, skipped_total)| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => return None,
                    received = rx.recv() => match received {
                        Ok(event) => return Some((event, (rx, closed, skipped_total))),
                        Err(RecvError::Lagged(skipped)) => {
                            skipped_total.fetch_add(skipped, Ordering::Relaxed);
                            tracing::warn!(
                                session_id = %session_id,
                                skipped = skipped,
                                "Subscriber lagged behind topic, events skipped"
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    },
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self, session_id: SessionId) {
        let removed = self.topics.write().await.remove(&session_id);
        if let Some(topic) = removed {
            topic.closed.cancel();
            tracing::debug!(
                session_id = %session_id,
                subscribers = topic.sender.receiver_count(),
                "Closed broadcast topic"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn comment(text: &str) -> CanonicalEvent {
        CanonicalEvent::comment("alice", text, Utc::now())
    }

    #[tokio::test]
    async fn test_fan_out_preserves_publish_order() {
        let channel = MemoryBroadcast::new(16);
        let session_id = SessionId::new();

        let mut sub1 = channel.subscribe(session_id).await.unwrap();
        let mut sub2 = channel.subscribe(session_id).await.unwrap();

        for text in ["e1", "e2", "e3"] {
            channel.publish(session_id, comment(text)).await;
        }

        for sub in [&mut sub1, &mut sub2] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(sub.next().await.unwrap().text().unwrap().to_string());
            }
            assert_eq!(seen, vec!["e1", "e2", "e3"]);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let channel = MemoryBroadcast::new(16);
        let session_id = SessionId::new();

        channel.publish(session_id, comment("lost")).await;
        assert_eq!(channel.topic_count().await, 0);

        let mut sub = channel.subscribe(session_id).await.unwrap();
        channel.publish(session_id, comment("kept")).await;
        assert_eq!(sub.next().await.unwrap().text(), Some("kept"));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let channel = MemoryBroadcast::new(16);
        let session_id = SessionId::new();

        let mut sub = channel.subscribe(session_id).await.unwrap();
        channel.publish(session_id, comment("buffered")).await;
        channel.close(session_id).await;

        // Closed topics deliver nothing further, buffered or not
        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert_eq!(channel.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let channel = MemoryBroadcast::new(16);
        let a = SessionId::new();
        let b = SessionId::new();

        let mut sub_a = channel.subscribe(a).await.unwrap();
        let _sub_b = channel.subscribe(b).await.unwrap();

        channel.publish(b, comment("for b")).await;
        channel.publish(a, comment("for a")).await;

        assert_eq!(sub_a.next().await.unwrap().text(), Some("for a"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_instead_of_blocking() {
        let channel = MemoryBroadcast::new(2);
        let session_id = SessionId::new();
        let mut sub = channel.subscribe(session_id).await.unwrap();

        for i in 0..10 {
            channel.publish(session_id, comment(&format!("e{}", i))).await;
        }

        // Only the newest events survive in a ring of two
        assert_eq!(sub.next().await.unwrap().text(), Some("e8"));
        assert_eq!(sub.next().await.unwrap().text(), Some("e9"));
        assert_eq!(channel.skipped_events(), 8);
    }

    #[tokio::test]
    async fn test_skipped_events_counted_per_subscriber() {
        let channel = MemoryBroadcast::new(2);
        let session_id = SessionId::new();
        let mut slow = channel.subscribe(session_id).await.unwrap();
        let mut fast = channel.subscribe(session_id).await.unwrap();

        channel.publish(session_id, comment("e0")).await;
        assert_eq!(fast.next().await.unwrap().text(), Some("e0"));
        channel.publish(session_id, comment("e1")).await;
        assert_eq!(fast.next().await.unwrap().text(), Some("e1"));
        for i in 2..5 {
            channel.publish(session_id, comment(&format!("e{}", i))).await;
        }
        assert_eq!(channel.skipped_events(), 0);

        assert_eq!(slow.next().await.unwrap().text(), Some("e3"));
        assert_eq!(channel.skipped_events(), 3);

        // The subscriber that kept up never lags
        for expected in ["e2", "e3", "e4"] {
            assert_eq!(fast.next().await.unwrap().text(), Some(expected));
        }
        assert_eq!(channel.skipped_events(), 3);
    }
}
