//! Overlay client subscriptions
//!
//! A subscription couples one broadcast stream to one delivery queue. A
//! forwarder task moves events from the stream into the queue; the socket
//! task drains the queue. The two never block each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use liverelay_shared::{EventStream, SessionId};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{CloseReason, ServerMessage};
use super::queue::DeliveryQueue;

/// Registry-side view of a subscription
#[derive(Debug)]
pub struct SubscriberHandle {
    pub subscription_id: Uuid,
    pub session_id: SessionId,
    pub joined_at: DateTime<Utc>,
    queue: Arc<DeliveryQueue>,
    forwarder: CancellationToken,
}

impl SubscriberHandle {
    /// End the subscription, delivering what is queued followed by `reason`
    pub fn close(&self, reason: CloseReason) {
        self.forwarder.cancel();
        self.queue.close(Some(reason));
    }

    /// End the subscription without a final message
    pub fn detach(&self) {
        self.forwarder.cancel();
        self.queue.close(None);
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

/// Connection-side view of a subscription
#[derive(Debug)]
pub struct ClientSubscription {
    pub subscription_id: Uuid,
    pub session_id: SessionId,
    pub joined_at: DateTime<Utc>,
    queue: Arc<DeliveryQueue>,
}

impl ClientSubscription {
    /// Next message for the client; `None` after the final `closed` message
    pub async fn next_message(&self) -> Option<ServerMessage> {
        self.queue.pop().await
    }
}

/// Start relaying `events` into a fresh bounded queue
pub fn subscribe(
    session_id: SessionId,
    events: EventStream,
    queue_bound: usize,
) -> (Arc<SubscriberHandle>, ClientSubscription) {
    let subscription_id = Uuid::new_v4();
    let joined_at = Utc::now();
    let queue = Arc::new(DeliveryQueue::new(queue_bound));
    let forwarder = CancellationToken::new();

    queue.push(ServerMessage::Connected {
        subscription_id,
        session_id,
    });

    tokio::spawn(forward(
        events,
        Arc::clone(&queue),
        forwarder.clone(),
        subscription_id,
    ));

    let handle = Arc::new(SubscriberHandle {
        subscription_id,
        session_id,
        joined_at,
        queue: Arc::clone(&queue),
        forwarder,
    });
    let subscription = ClientSubscription {
        subscription_id,
        session_id,
        joined_at,
        queue,
    };
    (handle, subscription)
}

async fn forward(
    mut events: EventStream,
    queue: Arc<DeliveryQueue>,
    cancel: CancellationToken,
    subscription_id: Uuid,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = events.next() => match next {
                Some(event) => {
                    if !queue.push(ServerMessage::Event(event)) {
                        return;
                    }
                }
                None => {
                    // Topic closed elsewhere, e.g. by another instance
                    if queue.close(Some(CloseReason::SessionEnded)) {
                        tracing::debug!(
                            subscription_id = %subscription_id,
                            "Broadcast stream ended, closing subscription"
                        );
                    }
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use liverelay_shared::CanonicalEvent;

    fn comments(texts: &[&str]) -> Vec<CanonicalEvent> {
        texts
            .iter()
            .map(|t| CanonicalEvent::comment("alice", *t, Utc::now()))
            .collect()
    }

    #[tokio::test]
    async fn test_connected_then_events_in_order() {
        let session_id = SessionId::new();
        let events = stream::iter(comments(&["e1", "e2"]))
            .chain(stream::pending())
            .boxed();
        let (handle, sub) = subscribe(session_id, events, 8);

        match sub.next_message().await {
            Some(ServerMessage::Connected {
                subscription_id,
                session_id: sid,
            }) => {
                assert_eq!(subscription_id, handle.subscription_id);
                assert_eq!(sid, session_id);
            }
            other => panic!("expected connected, got {:?}", other),
        }
        for expected in ["e1", "e2"] {
            match sub.next_message().await {
                Some(ServerMessage::Event(e)) => assert_eq!(e.text(), Some(expected)),
                other => panic!("expected event, got {:?}", other),
            }
        }

        handle.close(CloseReason::SessionEnded);
        assert_eq!(
            sub.next_message().await,
            Some(ServerMessage::Closed {
                reason: CloseReason::SessionEnded
            })
        );
        assert_eq!(sub.next_message().await, None);
    }

    #[tokio::test]
    async fn test_stream_end_closes_subscription() {
        let events = stream::iter(comments(&["only"])).boxed();
        let (_handle, sub) = subscribe(SessionId::new(), events, 8);

        let mut messages = Vec::new();
        while let Some(msg) = sub.next_message().await {
            messages.push(msg);
        }

        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages.last(),
            Some(&ServerMessage::Closed {
                reason: CloseReason::SessionEnded
            })
        );
    }

    #[tokio::test]
    async fn test_detach_ends_without_closed_message() {
        let events = stream::pending().boxed();
        let (handle, sub) = subscribe(SessionId::new(), events, 8);

        handle.detach();
        assert!(matches!(
            sub.next_message().await,
            Some(ServerMessage::Connected { .. })
        ));
        assert_eq!(sub.next_message().await, None);
    }
}
