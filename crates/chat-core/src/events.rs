//! Event infrastructure for chat sessions.
//!
//! Provides `ChatEvent` for everything a session wants shown or logged, and
//! `EventBus` for subscriptions. The CLI subscribes to print lines; tests
//! subscribe to assert on what a session observed.

use crate::session::SessionState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Observations emitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// Session moved between lifecycle states.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Chat message received and stored.
    MessageReceived {
        /// Sender's node ID (the store key)
        author: String,
        /// Stored text
        text: String,
        /// Display line (`author: text`)
        line: String,
    },
    /// Store replaced by a snapshot from another member.
    HistoryRestored {
        /// Display lines for every restored entry, sorted by author
        lines: Vec<String>,
    },
    /// Started without a snapshot although other members may exist.
    DegradedStart {
        /// Why state transfer failed.
        reason: String,
    },
    /// Chat group membership changed.
    ViewChanged {
        #[serde(rename = "viewId")]
        view_id: u64,
        members: Vec<String>,
    },
    /// First heartbeat from a node.
    NodeUp {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// Node missed heartbeats past the suspicion timeout.
    NodeDown {
        #[serde(rename = "nodeId")]
        node_id: String,
        /// Detector clock reading of the last heartbeat, in milliseconds.
        #[serde(rename = "lastSeenMs")]
        last_seen_ms: u64,
    },
    /// Outgoing chat line could not be broadcast.
    SendFailed {
        group: String,
        error: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(ChatEvent) + Send + Sync>;

/// Event bus for publishing chat events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(ChatEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ChatEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
