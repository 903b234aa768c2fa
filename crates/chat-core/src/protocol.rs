//! Wire envelopes for the chat and heartbeat groups.
//!
//! Both are small JSON objects tagged with a `type` field so a payload that
//! lands on the wrong group (or comes from an incompatible build) is
//! rejected instead of misread. Snapshots use bincode, see [`crate::store`].

use serde::{Deserialize, Serialize};

/// A line typed by a user, broadcast on the chat group.
///
/// Wire format: `{"type":"chat","name":"alice","text":"hi"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    msg_type: String,
    /// Display name chosen by the sender
    pub name: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(name: &str, text: &str) -> Self {
        Self {
            msg_type: "chat".to_string(),
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ChatMessage serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"chat"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.msg_type == "chat" {
            Some(msg)
        } else {
            None
        }
    }

    /// Text as stored and displayed: `[name] text`.
    pub fn rendered(&self) -> String {
        format!("[{}] {}", self.name, self.text)
    }
}

/// Liveness marker broadcast on the heartbeat group.
///
/// Wire format: `{"type":"heartbeat","seq":7}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "type")]
    msg_type: String,
    /// Per-sender tick counter, starting at 1
    pub seq: u64,
}

impl Heartbeat {
    pub fn new(seq: u64) -> Self {
        Self {
            msg_type: "heartbeat".to_string(),
            seq,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Heartbeat serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"heartbeat"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        if msg.msg_type == "heartbeat" {
            Some(msg)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== ChatMessage ====================

    #[test]
    fn test_chat_message_wire_format() {
        let json = String::from_utf8(ChatMessage::new("alice", "hi").to_json()).unwrap();
        assert_eq!(json, r#"{"type":"chat","name":"alice","text":"hi"}"#);
    }

    #[test]
    fn test_chat_message_parse() {
        let parsed =
            ChatMessage::from_json(br#"{"type":"chat","name":"bob","text":"yo"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::new("bob", "yo"));
        assert_eq!(parsed.rendered(), "[bob] yo");
    }

    #[test]
    fn test_chat_message_wrong_type() {
        let json = br#"{"type":"heartbeat","name":"bob","text":"yo"}"#;
        assert!(ChatMessage::from_json(json).is_none());
    }

    #[test]
    fn test_chat_message_invalid_json() {
        assert!(ChatMessage::from_json(b"heartbeat").is_none());
        assert!(ChatMessage::from_json(b"").is_none());
        assert!(ChatMessage::from_json(&[0xFF, 0xFE]).is_none());
    }

    // ==================== Heartbeat ====================

    #[test]
    fn test_heartbeat_wire_format() {
        let json = String::from_utf8(Heartbeat::new(7).to_json()).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat","seq":7}"#);
    }

    #[test]
    fn test_heartbeat_is_not_a_chat_message() {
        let heartbeat = Heartbeat::new(1).to_json();
        assert!(ChatMessage::from_json(&heartbeat).is_none());
        assert_eq!(Heartbeat::from_json(&heartbeat), Some(Heartbeat::new(1)));
    }

    #[test]
    fn test_chat_message_is_not_a_heartbeat() {
        let chat = ChatMessage::new("alice", "hi").to_json();
        assert!(Heartbeat::from_json(&chat).is_none());
    }
}
