//! Error types for LiveRelay shared components

use thiserror::Error;

/// Errors raised by a broadcast channel backend
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcast backend unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for BroadcastError {
    fn from(err: redis::RedisError) -> Self {
        BroadcastError::Unavailable(err.to_string())
    }
}
