//! Redis pub/sub broadcast channel for multi-process deployments.
//!
//! Ingestion and overlay delivery may run on different nodes; both sides only
//! agree on the topic name derived from the session ID.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::{BroadcastChannel, EventStream};
use crate::error::BroadcastError;
use crate::types::{CanonicalEvent, SessionId};

const TOPIC_PREFIX: &str = "liverelay:session:";
const SUBSCRIBE_RETRIES: usize = 3;
const SUBSCRIBE_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Envelope carried on the Redis channel
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TopicMessage {
    Event { event: CanonicalEvent },
    Closed,
}

/// Redis-backed broadcast channel
#[derive(Clone)]
pub struct RedisBroadcast {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBroadcast {
    /// Connect the shared publishing connection
    pub async fn connect(redis_url: &str) -> Result<Self, BroadcastError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        tracing::info!("Connected Redis broadcast channel");
        Ok(Self { client, publisher })
    }

    fn topic(session_id: SessionId) -> String {
        format!("{}{}", TOPIC_PREFIX, session_id)
    }

    async fn send(&self, session_id: SessionId, message: &TopicMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = ?e, session_id = %session_id, "Failed to encode topic message");
                return;
            }
        };

        let mut conn = self.publisher.clone();
        if let Err(e) = conn
            .publish::<_, _, i64>(Self::topic(session_id), payload)
            .await
        {
            tracing::warn!(error = %e, session_id = %session_id, "Redis PUBLISH failed");
        }
    }
}

fn decode(payload: &str) -> Option<TopicMessage> {
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring undecodable topic message");
            None
        }
    }
}

#[async_trait]
impl BroadcastChannel for RedisBroadcast {
    fn backend(&self) -> &'static str {
        "redis"
    }

    // Redis pub/sub drops the connection of a slow subscriber rather than
    // skipping messages
    fn skipped_events(&self) -> u64 {
        0
    }

    async fn publish(&self, session_id: SessionId, event: CanonicalEvent) {
        self.send(session_id, &TopicMessage::Event { event }).await;
    }

    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream, BroadcastError> {
        let topic = Self::topic(session_id);

        let retry_strategy = ExponentialBackoff::from_millis(10)
            .max_delay(SUBSCRIBE_RETRY_MAX_DELAY)
            .take(SUBSCRIBE_RETRIES)
            .map(jitter);

        let pubsub = Retry::spawn(retry_strategy, || {
            let client = self.client.clone();
            let topic = topic.clone();
            async move {
                let mut pubsub = client.get_async_pubsub().await?;
                pubsub.subscribe(&topic).await?;
                Ok::<_, redis::RedisError>(pubsub)
            }
        })
        .await?;

        tracing::debug!(session_id = %session_id, "Opened Redis subscription");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = msg.get_payload().ok()?;
                decode(&payload)
            })
            .take_while(|message| futures::future::ready(!matches!(message, TopicMessage::Closed)))
            .filter_map(|message| async move {
                match message {
                    TopicMessage::Event { event } => Some(event),
                    TopicMessage::Closed => None,
                }
            });

        Ok(stream.boxed())
    }

    async fn close(&self, session_id: SessionId) {
        self.send(session_id, &TopicMessage::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_topic_name_is_session_scoped() {
        let session_id = SessionId::new();
        assert_eq!(
            RedisBroadcast::topic(session_id),
            format!("liverelay:session:{}", session_id)
        );
    }

    #[test]
    fn test_envelope_format() {
        let event = CanonicalEvent::comment("alice", "hi", Utc::now());
        let json = serde_json::to_value(TopicMessage::Event { event }).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["text"], "hi");

        let closed = serde_json::to_string(&TopicMessage::Closed).unwrap();
        assert_eq!(closed, r#"{"type":"closed"}"#);
        assert!(matches!(decode(&closed), Some(TopicMessage::Closed)));
        assert!(decode("not json").is_none());
    }

    /// Requires a reachable Redis; skipped when REDIS_URL is unset
    #[tokio::test]
    async fn test_redis_round_trip_and_close() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("Skipping test_redis_round_trip_and_close: REDIS_URL unset");
            return;
        };
        let channel = RedisBroadcast::connect(&url).await.unwrap();
        let session_id = SessionId::new();

        let mut sub = channel.subscribe(session_id).await.unwrap();
        channel
            .publish(session_id, CanonicalEvent::comment("alice", "hi", Utc::now()))
            .await;
        channel.close(session_id).await;

        assert_eq!(sub.next().await.unwrap().text(), Some("hi"));
        assert!(sub.next().await.is_none());
    }
}
