//! In-process group transport.
//!
//! `LocalNetwork` is a shared registry of groups. Every `LocalTransport`
//! created from it sees the same groups, so several sessions in one process
//! (or one test) can talk to each other without sockets. Views are ordered
//! by join time; the oldest other member serves state requests.

use crate::transport::{
    GroupChannel, GroupEvent, GroupEvents, GroupTransport, Result, TransportError, View,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct Member {
    id: String,
    events: mpsc::UnboundedSender<GroupEvent>,
}

#[derive(Default)]
struct Group {
    /// Oldest first
    members: Vec<Member>,
    view_id: u64,
}

impl Group {
    /// Bump the view and send it to every member.
    fn publish_view(&mut self) {
        self.view_id += 1;
        let view = View::new(
            self.view_id,
            self.members.iter().map(|m| m.id.clone()).collect(),
        );
        for member in &self.members {
            let _ = member.events.send(GroupEvent::ViewChanged(view.clone()));
        }
    }
}

#[derive(Default)]
struct Registry {
    groups: HashMap<String, Group>,
    /// Nodes whose sends currently fail
    muted: HashSet<String>,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `node_id` on this network.
    pub fn transport(&self, node_id: impl Into<String>) -> LocalTransport {
        LocalTransport {
            node_id: node_id.into(),
            network: self.clone(),
        }
    }

    /// Current members of `group`, oldest first.
    pub fn members(&self, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every send from `node_id` fail (or succeed again).
    pub fn set_muted(&self, node_id: &str, muted: bool) {
        let mut registry = self.lock();
        if muted {
            registry.muted.insert(node_id.to_string());
        } else {
            registry.muted.remove(node_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's handle onto a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    node_id: String,
    network: LocalNetwork,
}

#[async_trait]
impl GroupTransport for LocalTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn connect(&self, group: &str) -> Result<(Arc<dyn GroupChannel>, GroupEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let mut registry = self.network.lock();
            let entry = registry.groups.entry(group.to_string()).or_default();
            if entry.members.iter().any(|m| m.id == self.node_id) {
                return Err(TransportError::ConnectionFailed(format!(
                    "{} already joined {}",
                    self.node_id, group
                )));
            }
            entry.members.push(Member {
                id: self.node_id.clone(),
                events: events_tx,
            });
            entry.publish_view();
        }

        debug!("{} joined local group {}", self.node_id, group);

        let channel = LocalChannel {
            group: group.to_string(),
            node_id: self.node_id.clone(),
            network: self.network.clone(),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(channel), events_rx))
    }
}

/// Membership of one node in one local group.
pub struct LocalChannel {
    group: String,
    node_id: String,
    network: LocalNetwork,
    closed: AtomicBool,
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn group(&self) -> &str {
        &self.group
    }

    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let registry = self.network.lock();
        if registry.muted.contains(&self.node_id) {
            return Err(TransportError::SendFailed(format!(
                "{} is muted",
                self.node_id
            )));
        }

        if let Some(group) = registry.groups.get(&self.group) {
            for member in &group.members {
                // A member that stopped listening just misses the message
                let _ = member.events.send(GroupEvent::Delivered {
                    from: self.node_id.clone(),
                    payload: payload.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn request_state(&self, timeout: Duration) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let registry = self.network.lock();
            let provider = registry
                .groups
                .get(&self.group)
                .and_then(|g| g.members.iter().find(|m| m.id != self.node_id))
                .ok_or(TransportError::NoStateProvider)?;

            debug!("{} requesting state from {}", self.node_id, provider.id);
            provider
                .events
                .send(GroupEvent::StateRequested {
                    requester: self.node_id.clone(),
                    reply: reply_tx,
                })
                .map_err(|_| TransportError::NoStateProvider)?;
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(TransportError::Other(
                "state provider dropped the request".into(),
            )),
            Err(_) => Err(TransportError::StateTimeout(timeout)),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut registry = self.network.lock();
        let now_empty = match registry.groups.get_mut(&self.group) {
            Some(group) => {
                group.members.retain(|m| m.id != self.node_id);
                if !group.members.is_empty() {
                    group.publish_view();
                }
                group.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.groups.remove(&self.group);
        }

        debug!("{} left local group {}", self.node_id, self.group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_view(events: &mut GroupEvents) -> View {
        loop {
            match events.recv().await {
                Some(GroupEvent::ViewChanged(view)) => return view,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_views_ordered_by_join() {
        let network = LocalNetwork::new();
        let (_a, mut a_events) = network.transport("a").connect("g").await.unwrap();
        let (_b, mut b_events) = network.transport("b").connect("g").await.unwrap();

        assert_eq!(next_view(&mut a_events).await.members, vec!["a"]);

        let view = next_view(&mut a_events).await;
        assert_eq!(view.members, vec!["a", "b"]);
        assert_eq!(view.id, 2);
        assert_eq!(next_view(&mut b_events).await, view);
        assert_eq!(network.members("g"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_double_join_rejected() {
        let network = LocalNetwork::new();
        let transport = network.transport("a");
        let _first = transport.connect("g").await.unwrap();

        let second = transport.connect("g").await;
        assert!(matches!(second, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_send_delivers_to_all_members_including_self() {
        let network = LocalNetwork::new();
        let (a, mut a_events) = network.transport("a").connect("g").await.unwrap();
        let (_b, mut b_events) = network.transport("b").connect("g").await.unwrap();

        a.send(b"hello").await.unwrap();

        for events in [&mut a_events, &mut b_events] {
            loop {
                match events.recv().await.unwrap() {
                    GroupEvent::Delivered { from, payload } => {
                        assert_eq!(from, "a");
                        assert_eq!(payload, b"hello");
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let network = LocalNetwork::new();
        let (chat, _chat_events) = network.transport("a").connect("chat").await.unwrap();
        let (_hb, mut hb_events) = network.transport("a").connect("heartbeat").await.unwrap();

        chat.send(b"hello").await.unwrap();

        // Only the initial view shows up on the other group
        assert!(matches!(
            hb_events.try_recv(),
            Ok(GroupEvent::ViewChanged(_))
        ));
        assert!(hb_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_muted_send_fails() {
        let network = LocalNetwork::new();
        let (a, _events) = network.transport("a").connect("g").await.unwrap();

        network.set_muted("a", true);
        assert!(matches!(
            a.send(b"x").await,
            Err(TransportError::SendFailed(_))
        ));

        network.set_muted("a", false);
        assert!(a.send(b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_request_state_alone_has_no_provider() {
        let network = LocalNetwork::new();
        let (a, _events) = network.transport("a").connect("g").await.unwrap();

        let result = a.request_state(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransportError::NoStateProvider)));
    }

    #[tokio::test]
    async fn test_request_state_served_by_oldest_member() {
        let network = LocalNetwork::new();
        let (_a, mut a_events) = network.transport("a").connect("g").await.unwrap();
        let (b, _b_events) = network.transport("b").connect("g").await.unwrap();

        let provider = tokio::spawn(async move {
            loop {
                if let Some(GroupEvent::StateRequested { requester, reply }) =
                    a_events.recv().await
                {
                    assert_eq!(requester, "b");
                    let _ = reply.send(b"state".to_vec());
                    break;
                }
            }
        });

        let state = b.request_state(Duration::from_secs(1)).await.unwrap();
        assert_eq!(state, b"state");
        provider.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_state_times_out() {
        let network = LocalNetwork::new();
        // Provider never reads its events
        let (_a, _a_events) = network.transport("a").connect("g").await.unwrap();
        let (b, _b_events) = network.transport("b").connect("g").await.unwrap();

        let result = b.request_state(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(TransportError::StateTimeout(_))));
    }

    #[tokio::test]
    async fn test_close_publishes_view_and_blocks_sends() {
        let network = LocalNetwork::new();
        let (a, _a_events) = network.transport("a").connect("g").await.unwrap();
        let (_b, mut b_events) = network.transport("b").connect("g").await.unwrap();
        next_view(&mut b_events).await;

        a.close().await.unwrap();
        assert_eq!(next_view(&mut b_events).await.members, vec!["b"]);
        assert!(matches!(a.send(b"x").await, Err(TransportError::Closed)));

        // Closing twice is a no-op
        a.close().await.unwrap();
        assert_eq!(network.members("g"), vec!["b"]);
    }
}
