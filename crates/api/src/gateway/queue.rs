//! Bounded per-connection outbound queue
//!
//! The producer side never waits: when the queue already holds `bound`
//! events the oldest one is discarded to make room and the drop counter goes
//! up. Control messages do not count toward the bound. Closing
//! appends the final `closed` message past the bound, so events already
//! queued are still delivered ahead of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::events::{CloseReason, ServerMessage};

#[derive(Debug, Default)]
struct Inner {
    messages: VecDeque<ServerMessage>,
    /// Queued `Event` messages
    events: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    bound: usize,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(bound: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            bound: bound.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue without waiting; returns false once the queue is closed
    pub fn push(&self, message: ServerMessage) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            if message.is_event() {
                if inner.events >= self.bound {
                    if let Some(pos) = inner.messages.iter().position(ServerMessage::is_event) {
                        inner.messages.remove(pos);
                        inner.events -= 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                inner.events += 1;
            }
            inner.messages.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Stop accepting messages and queue the final `closed` message
    ///
    /// Returns false if the queue was already closed.
    pub fn close(&self, reason: Option<CloseReason>) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            if let Some(reason) = reason {
                inner.messages.push_back(ServerMessage::Closed { reason });
            }
        }
        self.notify.notify_one();
        true
    }

    /// Next queued message; `None` once closed and drained
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(message) = inner.messages.pop_front() {
                    if message.is_event() {
                        inner.events -= 1;
                    }
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
