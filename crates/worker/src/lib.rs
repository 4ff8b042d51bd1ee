//! LiveRelay ingestion
//!
//! Connects to the upstream live-chat source for one broadcast session,
//! normalizes each raw event into a [`CanonicalEvent`] and publishes it on
//! the session's broadcast topic.
//!
//! [`CanonicalEvent`]: liverelay_shared::CanonicalEvent

pub mod adapter;
pub mod error;
pub mod normalizer;
pub mod source;

pub use adapter::{
    AdapterConfig, AdapterContext, AdapterExit, AdapterStatus, IngestStats, IngestStatsSnapshot,
    IngestionAdapter,
};
pub use error::{IngestError, NormalizeError};
pub use normalizer::Normalizer;
pub use source::{LiveSource, RawEvent, RawEventStream, WebSocketLiveSource};
