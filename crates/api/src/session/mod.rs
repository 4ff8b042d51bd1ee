//! Broadcast session lifecycle
//!
//! `Inactive → Starting → Active → Stopping → Inactive`, one live session
//! per user at a time.

pub mod manager;
pub mod model;

pub use manager::{SessionGuard, SessionManager};
pub use model::{BroadcastSession, SessionView, StartedSession};
