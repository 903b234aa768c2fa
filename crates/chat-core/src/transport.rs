//! GroupTransport trait for group communication.
//!
//! Implementations:
//! - In-process: [`crate::local::LocalNetwork`] (tests, single-process demos)
//! - WebSocket mesh: `chat_node::WsTransport` (desktop nodes)
//!
//! Transport callbacks (delivery, view change, state provision) are surfaced
//! as [`GroupEvent`]s on the receiver returned by [`GroupTransport::connect`],
//! so the consumer decides on which task they run.

use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("State transfer timed out after {0:?}")]
    StateTimeout(Duration),

    #[error("No other member can provide state")]
    NoStateProvider,

    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Membership of a group as last reported by the transport.
///
/// Members are ordered; the first member is the oldest and acts as the
/// coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    /// Increases with every membership change seen by this node
    pub id: u64,
    /// Member identifiers, oldest first
    pub members: Vec<String>,
}

impl View {
    pub fn new(id: u64, members: Vec<String>) -> Self {
        Self { id, members }
    }

    pub fn coordinator(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}|{}] ({}) [{}]",
            self.coordinator().unwrap_or("-"),
            self.id,
            self.members.len(),
            self.members.join(", ")
        )
    }
}

/// Event delivered by a group channel.
#[derive(Debug)]
pub enum GroupEvent {
    /// A broadcast payload (our own broadcasts are delivered too)
    Delivered { from: String, payload: Vec<u8> },
    /// Membership changed; replaces any previous view wholesale
    ViewChanged(View),
    /// Another member asked for our state. Answer through `reply`;
    /// dropping it fails the request on the other side.
    StateRequested {
        requester: String,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Receiving half of a group connection.
pub type GroupEvents = mpsc::UnboundedReceiver<GroupEvent>;

/// A connection to a single named group.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    /// Name of the group this channel is connected to
    fn group(&self) -> &str;

    /// Our identifier within the group
    fn local_id(&self) -> &str;

    /// Best-effort broadcast to every member, including ourselves
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Ask the coordinator for its state, waiting at most `timeout`
    async fn request_state(&self, timeout: Duration) -> Result<Vec<u8>>;

    /// Leave the group. Sends after close fail with [`TransportError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Group communication substrate.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Our node identifier
    fn local_id(&self) -> &str;

    /// Join a group, returning the channel and its event stream
    async fn connect(&self, group: &str) -> Result<(Arc<dyn GroupChannel>, GroupEvents)>;
}
