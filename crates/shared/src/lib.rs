//! LiveRelay Shared Types and Utilities
//!
//! This crate contains the identifiers, the canonical event schema and the
//! broadcast channel abstraction shared by ingestion and overlay delivery.

pub mod broadcast;
pub mod error;
pub mod types;

pub use broadcast::{BroadcastChannel, EventStream, MemoryBroadcast, RedisBroadcast};
pub use error::*;
pub use types::*;
