//! chat-node library: the WebSocket mesh transport.
//!
//! This is a thin library layer under the `chat-node` binary,
//! allowing integration tests to run nodes in-process.

pub mod connection;
mod hub;
pub mod message;
pub mod transport;

// Re-export key types for convenience
pub use connection::{ConnectionEvent, FrameSender, PeerConnection};
pub use message::{Frame, GroupMembership, MAX_MESSAGE_SIZE};
pub use transport::{WsChannel, WsTransport, WsTransportConfig};
