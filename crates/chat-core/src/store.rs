//! Replicated chat state.
//!
//! The store keeps one entry per author: the most recently received line.
//! It is not a log; a new message replaces the author's previous one.
//! New members receive the whole map through state transfer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

/// Snapshot format version. Bump when `ChatEntry` changes shape.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to encode snapshot: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Failed to decode snapshot: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Latest message from one author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Message text as received
    pub text: String,
    /// When this node received it, in milliseconds since Unix epoch
    pub received_at_ms: u64,
}

impl Display for ChatEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.received_at_ms, self.text)
    }
}

/// Wire form of a snapshot (bincode).
///
/// `BTreeMap` keeps the encoding independent of hash order.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, ChatEntry>,
}

/// Latest-value-per-author chat table.
///
/// Owned by a single session task; concurrent access goes through that
/// task's event loop, so no lock is needed here.
#[derive(Debug, Default, Clone)]
pub struct ChatStore {
    entries: HashMap<String, ChatEntry>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `text` as the only entry for `author`, stamped with the current
    /// time. Returns the display line `author: text`.
    pub fn put(&mut self, author: &str, text: &str) -> String {
        self.put_at(author, text, unix_time_ms())
    }

    /// Like [`put`](Self::put) with an explicit receipt time.
    pub fn put_at(&mut self, author: &str, text: &str, received_at_ms: u64) -> String {
        self.entries.insert(
            author.to_string(),
            ChatEntry {
                text: text.to_string(),
                received_at_ms,
            },
        );
        format!("{}: {}", author, text)
    }

    pub fn get(&self, author: &str) -> Option<&ChatEntry> {
        self.entries.get(author)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries sorted by author.
    pub fn entries(&self) -> Vec<(&str, &ChatEntry)> {
        let mut entries: Vec<(&str, &ChatEntry)> = self
            .entries
            .iter()
            .map(|(author, entry)| (author.as_str(), entry))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Display lines (`author: text`) for every entry, sorted by author.
    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|(author, entry)| format!("{}: {}", author, entry.text))
            .collect()
    }

    /// Serialize the whole map for a joining peer.
    pub fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(author, entry)| (author.clone(), entry.clone()))
                .collect(),
        };
        bincode::serialize(&snapshot).map_err(StoreError::Encode)
    }

    /// Replace the whole map with the contents of `bytes`.
    ///
    /// Nothing is merged: entries not in the snapshot are dropped. On error
    /// the store is left untouched.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let snapshot: Snapshot = bincode::deserialize(bytes).map_err(StoreError::Decode)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        self.entries = snapshot.entries.into_iter().collect();
        Ok(())
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(store: &ChatStore) -> Vec<(String, String)> {
        store
            .entries()
            .into_iter()
            .map(|(author, entry)| (author.to_string(), entry.text.clone()))
            .collect()
    }

    #[test]
    fn test_put_returns_display_line() {
        let mut store = ChatStore::new();
        let line = store.put("alice", "hi");

        assert_eq!(line, "alice: hi");
        assert_eq!(store.get("alice").map(|e| e.text.as_str()), Some("hi"));
        assert!(store.get("alice").unwrap().received_at_ms > 0);
    }

    #[test]
    fn test_put_overwrites_previous_entry() {
        let mut store = ChatStore::new();
        store.put_at("alice", "hi", 1);
        store.put_at("alice", "hello", 2);

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("alice"),
            Some(&ChatEntry {
                text: "hello".into(),
                received_at_ms: 2
            })
        );
    }

    #[test]
    fn test_overwritten_text_absent_from_snapshot() {
        let mut store = ChatStore::new();
        store.put("alice", "hi");
        store.put("alice", "hello");

        let mut copy = ChatStore::new();
        copy.restore(&store.snapshot().unwrap()).unwrap();

        assert_eq!(texts(&copy), vec![("alice".into(), "hello".into())]);
    }

    #[test]
    fn test_authors_do_not_merge() {
        let mut store = ChatStore::new();
        store.put_at("bob", "yo", 1);
        store.put_at("alice", "hi", 2);

        assert_eq!(
            store.lines(),
            vec!["alice: hi".to_string(), "bob: yo".to_string()]
        );
    }

    #[test]
    fn test_restore_is_content_equal() {
        let mut store = ChatStore::new();
        store.put_at("alice", "hi", 10);
        store.put_at("bob", "yo", 20);

        let mut copy = ChatStore::new();
        copy.restore(&store.snapshot().unwrap()).unwrap();

        assert_eq!(copy.entries(), store.entries());
    }

    #[test]
    fn test_restore_replaces_local_entries() {
        let mut remote = ChatStore::new();
        remote.put_at("bob", "yo", 5);

        let mut local = ChatStore::new();
        local.put_at("carol", "old", 1);
        local.restore(&remote.snapshot().unwrap()).unwrap();

        assert_eq!(texts(&local), vec![("bob".into(), "yo".into())]);
        assert!(local.get("carol").is_none());
    }

    #[test]
    fn test_restore_empty_snapshot_clears_store() {
        let mut local = ChatStore::new();
        local.put_at("carol", "old", 1);
        local.restore(&ChatStore::new().snapshot().unwrap()).unwrap();

        assert!(local.is_empty());
    }

    #[test]
    fn test_restore_garbage_fails_and_keeps_state() {
        let mut local = ChatStore::new();
        local.put_at("carol", "old", 1);

        let result = local.restore(b"not a snapshot");
        assert!(matches!(result, Err(StoreError::Decode(_))));
        assert_eq!(texts(&local), vec![("carol".into(), "old".into())]);
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let bytes = bincode::serialize(&Snapshot {
            version: 99,
            entries: BTreeMap::new(),
        })
        .unwrap();

        let mut local = ChatStore::new();
        let result = local.restore(&bytes);
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedVersion {
                found: 99,
                expected: SNAPSHOT_VERSION
            })
        ));
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let mut a = ChatStore::new();
        a.put_at("alice", "hi", 1);
        a.put_at("bob", "yo", 2);

        let mut b = ChatStore::new();
        b.put_at("bob", "yo", 2);
        b.put_at("alice", "hi", 1);

        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn test_entry_display() {
        let entry = ChatEntry {
            text: "hello".into(),
            received_at_ms: 42,
        };
        assert_eq!(entry.to_string(), "[42] hello");
    }
}
