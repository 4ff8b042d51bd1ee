//! Upstream live-chat sources
//!
//! A [`LiveSource`] opens one connection per call and yields raw JSON events
//! until the upstream goes away. Reconnecting is the adapter's job, not the
//! source's.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::IngestError;

/// Raw, source-specific event payload
pub type RawEvent = serde_json::Value;

/// Events from one upstream connection; the stream ends when it drops
pub type RawEventStream = BoxStream<'static, Result<RawEvent, IngestError>>;

/// Connection factory for the external live-chat service
#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Connect to the live room of `handle`
    async fn connect(&self, handle: &str) -> Result<RawEventStream, IngestError>;
}

/// Live source speaking JSON text frames over a WebSocket
///
/// Connects to `<base_url>?unique_id=<handle>`; every text or binary frame
/// is expected to hold one JSON event.
#[derive(Debug, Clone)]
pub struct WebSocketLiveSource {
    base_url: Url,
}

impl WebSocketLiveSource {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| IngestError::ConnectionFailed(format!("invalid source url: {}", e)))?;
        Ok(Self { base_url })
    }

    fn room_url(&self, handle: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("unique_id", handle.trim_start_matches('@'));
        url
    }
}

fn decode_frame(message: Message) -> Option<Result<RawEvent, IngestError>> {
    match message {
        Message::Text(text) => {
            Some(serde_json::from_str(&text).map_err(|e| IngestError::Decode(e.to_string())))
        }
        Message::Binary(bytes) => {
            Some(serde_json::from_slice(&bytes).map_err(|e| IngestError::Decode(e.to_string())))
        }
        Message::Close(frame) => Some(Err(IngestError::Disconnected(
            frame
                .map(|f| format!("closed by upstream: {}", f.reason))
                .unwrap_or_else(|| "closed by upstream".to_string()),
        ))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

#[async_trait]
impl LiveSource for WebSocketLiveSource {
    async fn connect(&self, handle: &str) -> Result<RawEventStream, IngestError> {
        let url = self.room_url(handle);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| IngestError::ConnectionFailed(e.to_string()))?;

        tracing::info!(handle = %handle, "Connected to live source");

        let stream = ws.filter_map(|frame| async move {
            match frame {
                Ok(message) => decode_frame(message),
                Err(e) => Some(Err(IngestError::Disconnected(e.to_string()))),
            }
        });

        Ok(stream.boxed())
    }
}

/// Scripted in-process source for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::{LiveSource, RawEvent, RawEventStream};
    use crate::error::IngestError;

    /// Sender side of one scripted upstream connection
    ///
    /// Dropping it ends the connection, which the adapter sees as a
    /// disconnect.
    pub type Feed = mpsc::UnboundedSender<Result<RawEvent, IngestError>>;

    enum Script {
        Fail,
        Connect(mpsc::UnboundedReceiver<Result<RawEvent, IngestError>>),
    }

    #[derive(Default)]
    struct Room {
        scripts: VecDeque<Script>,
        attempts: usize,
    }

    /// Live source whose connection outcomes are queued ahead of time per handle
    ///
    /// A connect with nothing queued fails.
    #[derive(Default)]
    pub struct ScriptedSource {
        rooms: Mutex<HashMap<String, Room>>,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a failed connection attempt
        pub fn push_failure(&self, handle: &str) {
            self.with_room(handle, |room| room.scripts.push_back(Script::Fail));
        }

        /// Queue a successful connection and return its feed
        pub fn push_connection(&self, handle: &str) -> Feed {
            let (tx, rx) = mpsc::unbounded_channel();
            self.with_room(handle, |room| room.scripts.push_back(Script::Connect(rx)));
            tx
        }

        /// Number of connect calls seen for `handle`
        pub fn attempts(&self, handle: &str) -> usize {
            self.with_room(handle, |room| room.attempts)
        }

        fn with_room<T>(&self, handle: &str, f: impl FnOnce(&mut Room) -> T) -> T {
            let mut rooms = match self.rooms.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(rooms.entry(handle.to_string()).or_default())
        }
    }

    #[async_trait]
    impl LiveSource for ScriptedSource {
        async fn connect(&self, handle: &str) -> Result<RawEventStream, IngestError> {
            let script = self.with_room(handle, |room| {
                room.attempts += 1;
                room.scripts.pop_front()
            });
            match script {
                Some(Script::Connect(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                Some(Script::Fail) | None => Err(IngestError::ConnectionFailed(format!(
                    "scripted failure for {}",
                    handle
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url_strips_at_sign() {
        let source = WebSocketLiveSource::new("ws://localhost:8765/live").unwrap();
        assert_eq!(
            source.room_url("@streamer").as_str(),
            "ws://localhost:8765/live?unique_id=streamer"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(WebSocketLiveSource::new("not a url").is_err());
    }

    #[test]
    fn test_decode_frames() {
        let ok = decode_frame(Message::Text(r#"{"comment":"hi"}"#.into()));
        assert!(matches!(ok, Some(Ok(_))));

        let bad = decode_frame(Message::Text("{nope".into()));
        assert!(matches!(bad, Some(Err(IngestError::Decode(_)))));

        assert!(decode_frame(Message::Ping(Vec::new())).is_none());
        assert!(matches!(
            decode_frame(Message::Close(None)),
            Some(Err(IngestError::Disconnected(_)))
        ));
    }
}
