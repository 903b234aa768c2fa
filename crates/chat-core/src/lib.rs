//! chat-core: membership-aware group chat.
//!
//! This crate provides:
//! - A passive heartbeat failure detector
//! - A latest-message-per-author chat store with snapshot transfer
//! - The `GroupTransport` abstraction plus an in-process implementation
//! - The session orchestrator tying them into one join/chat/leave lifecycle

pub mod command;
pub mod emitter;
pub mod events;
pub mod failure;
pub mod local;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use command::{Command, DEFAULT_DISPLAY_NAME, display_name};
pub use emitter::HeartbeatEmitter;
pub use events::{ChatEvent, EventBus, Subscription};
pub use failure::{FailureDetector, FailureDetectorConfig, FailureEvent};
pub use local::{LocalNetwork, LocalTransport};
pub use protocol::{ChatMessage, Heartbeat};
pub use session::{Session, SessionConfig, SessionError, SessionState};
pub use store::{ChatEntry, ChatStore, StoreError};
pub use transport::{GroupChannel, GroupEvent, GroupEvents, GroupTransport, TransportError, View};
