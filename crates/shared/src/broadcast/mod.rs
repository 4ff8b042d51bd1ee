//! Broadcast channel abstraction
//!
//! Decouples ingestion from overlay delivery. One logical topic exists per
//! broadcast session; publishers and subscribers only ever name the topic by
//! [`SessionId`], so nothing here assumes the two sides share a process.
//!
//! # Contract
//!
//! - `publish` is fire-and-forget and at-most-once. Events published while a
//!   topic has no subscribers are lost.
//! - `subscribe` yields events in publish order for a single publisher, until
//!   the subscriber drops the stream or the topic is closed.
//! - `close` terminates every subscription of the topic; no further events
//!   are delivered to them.

pub mod memory;
pub mod redis_pubsub;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BroadcastError;
use crate::types::{CanonicalEvent, SessionId};

pub use self::memory::MemoryBroadcast;
pub use self::redis_pubsub::RedisBroadcast;

/// Lazy, possibly infinite sequence of events for one subscriber
pub type EventStream = BoxStream<'static, CanonicalEvent>;

/// Publish/subscribe transport keyed by session
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Short backend name for health output
    fn backend(&self) -> &'static str;

    /// Deliver `event` to the current subscribers of the session topic
    async fn publish(&self, session_id: SessionId, event: CanonicalEvent);

    /// Open a new subscription on the session topic
    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream, BroadcastError>;

    /// Close the session topic, ending all of its subscriptions
    async fn close(&self, session_id: SessionId);

    /// Events subscribers skipped because they fell behind, across all topics
    fn skipped_events(&self) -> u64;
}
