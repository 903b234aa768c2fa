//! Mesh protocol frames.
//!
//! Every frame is JSON sent as a binary WebSocket frame (UTF-8 bytes),
//! tagged by its `type` field. Group payloads and snapshots travel inside
//! `deliver` and `stateResponse` frames untouched.

use serde::{Deserialize, Serialize};

/// Maximum message size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// A group this node belongs to, and when it joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: String,
    /// Milliseconds since Unix epoch; orders members within a view
    #[serde(rename = "joinedAt")]
    pub joined_at: u64,
}

/// Frame exchanged between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// First frame on every connection, in both directions
    Handshake {
        #[serde(rename = "peerId")]
        peer_id: String,
        /// Address others can dial to reach the sender
        address: Option<String>,
        /// Groups the sender has already joined
        #[serde(default)]
        groups: Vec<GroupMembership>,
    },
    /// Addresses of every peer the sender knows
    Peers { addresses: Vec<String> },
    Join {
        group: String,
        #[serde(rename = "joinedAt")]
        joined_at: u64,
    },
    Leave { group: String },
    /// Broadcast payload for one group
    Deliver { group: String, payload: Vec<u8> },
    StateRequest {
        group: String,
        #[serde(rename = "requestId")]
        request_id: u64,
    },
    /// Answer to a `stateRequest`; `state` is absent when the
    /// provider could not produce one
    StateResponse {
        group: String,
        #[serde(rename = "requestId")]
        request_id: u64,
        state: Option<Vec<u8>>,
    },
}

impl Frame {
    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Frame serialization should not fail")
    }

    /// Try to parse a frame from binary data.
    ///
    /// Returns None if the data is not valid JSON or has an unknown `type`.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::Peers { .. } => "peers",
            Frame::Join { .. } => "join",
            Frame::Leave { .. } => "leave",
            Frame::Deliver { .. } => "deliver",
            Frame::StateRequest { .. } => "stateRequest",
            Frame::StateResponse { .. } => "stateResponse",
        }
    }
}
