//! Mesh hub: the single task owning every connection and group.
//!
//! The hub accepts and dials WebSocket connections, resolves them to peer
//! IDs through the handshake, tracks which peers joined which groups, and
//! computes a view per locally joined group. Views are ordered by
//! `(joinedAt, peer ID)`, so every node derives the same order from the same
//! memberships. Handles (`WsTransport`, `WsChannel`) talk to it through
//! [`HubCommand`]s.
//!
//! Two nodes dialing each other at once end up with two connections. Both
//! stay open; frames are accepted from either and sent on the one opened by
//! the lower peer ID.
//!
//! State requests made before the seed dials have settled are held until
//! every dial resolves and every open connection has sent its handshake and
//! peer list.

use crate::connection::{ConnectionEvent, PeerConnection};
use crate::message::{Frame, GroupMembership};
use chat_core::transport::{GroupEvent, GroupEvents, Result, TransportError, View};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};
use web_time::{SystemTime, UNIX_EPOCH};

/// Request from a transport or channel handle.
pub(crate) enum HubCommand {
    Join {
        group: String,
        reply: oneshot::Sender<Result<GroupEvents>>,
    },
    Leave {
        group: String,
        reply: oneshot::Sender<()>,
    },
    Send {
        group: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestState {
        group: String,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Connection {
    handle: PeerConnection,
    /// Address we dialed, `None` if accepted
    dialed: Option<String>,
    /// Known after handshake
    peer_id: Option<String>,
    /// Peer list received; always follows the handshake
    greeted: bool,
}

struct Peer {
    address: Option<String>,
    /// Group name -> joinedAt
    groups: HashMap<String, u64>,
    conns: Vec<u64>,
}

struct LocalGroup {
    joined_at: u64,
    events: mpsc::UnboundedSender<GroupEvent>,
    view: View,
}

struct PendingState {
    provider: String,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

pub(crate) struct Hub {
    peer_id: String,
    address: String,
    seeds: Vec<String>,
    connections: HashMap<u64, Connection>,
    peers: HashMap<String, Peer>,
    groups: HashMap<String, LocalGroup>,
    /// Dials in flight
    dialing: HashSet<String>,
    /// Addresses that turned out to be our own
    self_addresses: HashSet<String>,
    /// Addresses whose last dial failed; retries log quietly
    unreachable: HashSet<String>,
    pending_state: HashMap<u64, PendingState>,
    /// Set until the seed dials first settle
    bootstrapping: bool,
    /// State requests waiting for bootstrap to finish
    held_state: Vec<(String, oneshot::Sender<Result<Vec<u8>>>)>,
    next_conn_id: u64,
    next_request_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Hub {
    pub(crate) fn new(peer_id: String, address: String, seeds: Vec<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            bootstrapping: !seeds.is_empty(),
            held_state: Vec::new(),
            peer_id,
            address,
            seeds,
            connections: HashMap::new(),
            peers: HashMap::new(),
            groups: HashMap::new(),
            dialing: HashSet::new(),
            self_addresses: HashSet::new(),
            unreachable: HashSet::new(),
            pending_state: HashMap::new(),
            next_conn_id: 1,
            next_request_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Main loop. Returns after `Shutdown` or once every handle is dropped.
    pub(crate) async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::UnboundedReceiver<HubCommand>,
        redial_interval: Duration,
    ) {
        for seed in self.seeds.clone() {
            self.dial_if_unknown(&seed);
        }
        // Every seed may be our own address
        self.release_held_requests();

        let mut redial = tokio::time::interval(redial_interval);
        redial.set_missed_tick_behavior(MissedTickBehavior::Delay);
        redial.tick().await;

        let done = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                command = commands.recv() => match command {
                    Some(HubCommand::Shutdown { done }) => break Some(done),
                    Some(command) => self.on_command(command),
                    None => break None,
                },
                Some(event) = self.event_rx.recv() => self.on_connection_event(event),
                _ = redial.tick() => {
                    for seed in self.seeds.clone() {
                        self.dial_if_unknown(&seed);
                    }
                }
            }
        };

        for conn in self.connections.values() {
            conn.handle.close();
        }
        info!("Mesh hub for {} stopped", self.peer_id);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    // ==================== Connections ====================

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.allocate_conn_id();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    debug!("Accepted connection from {} (conn-{})", addr, conn_id);
                    let conn = PeerConnection::new(conn_id, ws, event_tx.clone());
                    let _ = event_tx.send(ConnectionEvent::Opened { conn, dialed: None });
                }
                Err(e) => {
                    // Port probes close before finishing the upgrade
                    debug!("WebSocket upgrade failed for {}: {}", addr, e);
                }
            }
        });
    }

    fn dial_if_unknown(&mut self, address: &str) {
        let known = address == self.address
            || self.self_addresses.contains(address)
            || self.dialing.contains(address)
            || self
                .connections
                .values()
                .any(|c| c.dialed.as_deref() == Some(address))
            || self
                .peers
                .values()
                .any(|p| p.address.as_deref() == Some(address));
        if !known {
            self.dial(address.to_string());
        }
    }

    fn dial(&mut self, address: String) {
        let conn_id = self.allocate_conn_id();
        let event_tx = self.event_tx.clone();
        self.dialing.insert(address.clone());
        debug!("Dialing {} (conn-{})", address, conn_id);

        tokio::spawn(async move {
            match connect_async(address.as_str()).await {
                Ok((ws, _)) => {
                    let conn = PeerConnection::new(conn_id, ws, event_tx.clone());
                    let _ = event_tx.send(ConnectionEvent::Opened {
                        conn,
                        dialed: Some(address),
                    });
                }
                Err(e) => {
                    let _ = event_tx.send(ConnectionEvent::DialFailed {
                        address,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    fn allocate_conn_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { conn, dialed } => self.on_opened(conn, dialed),
            ConnectionEvent::DialFailed { address, error } => {
                self.dialing.remove(&address);
                if self.unreachable.insert(address.clone()) {
                    warn!("Failed to connect to {}: {}", address, error);
                } else {
                    debug!("Still cannot reach {}: {}", address, error);
                }
            }
            ConnectionEvent::Frame { conn_id, frame } => self.on_frame(conn_id, frame),
            ConnectionEvent::Closed { conn_id } => self.on_closed(conn_id),
        }
        self.release_held_requests();
    }

    /// End bootstrap once no dial is in flight and every connection has
    /// been greeted, then answer the held state requests.
    fn release_held_requests(&mut self) {
        if !self.bootstrapping {
            return;
        }
        let settled =
            self.dialing.is_empty() && self.connections.values().all(|c| c.greeted);
        if !settled {
            return;
        }

        self.bootstrapping = false;
        debug!("Seed connections settled with {} peer(s)", self.peers.len());
        for (group, reply) in std::mem::take(&mut self.held_state) {
            if !reply.is_closed() {
                self.request_state(group, reply);
            }
        }
    }

    fn on_opened(&mut self, conn: PeerConnection, dialed: Option<String>) {
        if let Some(address) = &dialed {
            self.dialing.remove(address);
            self.unreachable.remove(address);
        }

        let handshake = Frame::Handshake {
            peer_id: self.peer_id.clone(),
            address: Some(self.address.clone()),
            groups: self
                .groups
                .iter()
                .map(|(group, local)| GroupMembership {
                    group: group.clone(),
                    joined_at: local.joined_at,
                })
                .collect(),
        };
        let peers = Frame::Peers {
            addresses: self
                .peers
                .values()
                .filter_map(|p| p.address.clone())
                .collect(),
        };

        if let Err(e) = conn.send(&handshake).and_then(|_| conn.send(&peers)) {
            error!("Failed to send handshake on conn-{}: {}", conn.conn_id(), e);
            return;
        }

        self.connections.insert(
            conn.conn_id(),
            Connection {
                handle: conn,
                dialed,
                peer_id: None,
                greeted: false,
            },
        );
    }

    fn on_closed(&mut self, conn_id: u64) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        let Some(peer_id) = conn.peer_id else {
            debug!("conn-{} closed before handshake", conn_id);
            return;
        };

        let gone = match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.conns.retain(|c| *c != conn_id);
                peer.conns.is_empty()
            }
            None => false,
        };
        if gone {
            self.remove_peer(&peer_id);
        }
    }

    fn remove_peer(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        info!("Peer disconnected: {}", peer_id);

        // Requesters see the dropped reply as a failed transfer
        self.pending_state.retain(|_, p| p.provider != peer_id);

        for group in peer.groups.keys() {
            self.refresh_view(group);
        }
    }

    // ==================== Frames ====================

    fn on_frame(&mut self, conn_id: u64, frame: Frame) {
        let frame = match frame {
            Frame::Handshake {
                peer_id,
                address,
                groups,
            } => {
                self.on_handshake(conn_id, peer_id, address, groups);
                return;
            }
            frame => frame,
        };

        let Some(peer_id) = self
            .connections
            .get(&conn_id)
            .and_then(|c| c.peer_id.clone())
        else {
            debug!("Dropping {} frame on conn-{} before handshake", frame.kind(), conn_id);
            return;
        };

        match frame {
            Frame::Handshake { .. } => {}
            Frame::Peers { addresses } => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.greeted = true;
                }
                for address in addresses {
                    self.dial_if_unknown(&address);
                }
            }
            Frame::Join { group, joined_at } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.groups.insert(group.clone(), joined_at);
                }
                debug!("{} joined {}", peer_id, group);
                self.refresh_view(&group);
            }
            Frame::Leave { group } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.groups.remove(&group);
                }
                debug!("{} left {}", peer_id, group);
                self.refresh_view(&group);
            }
            Frame::Deliver { group, payload } => {
                if let Some(local) = self.groups.get(&group) {
                    let _ = local.events.send(GroupEvent::Delivered {
                        from: peer_id,
                        payload,
                    });
                }
            }
            Frame::StateRequest { group, request_id } => {
                self.on_state_request(conn_id, peer_id, group, request_id);
            }
            Frame::StateResponse {
                request_id, state, ..
            } => {
                let Some(pending) = self.pending_state.remove(&request_id) else {
                    debug!("Late state response {} from {}", request_id, peer_id);
                    return;
                };
                let result = state.ok_or_else(|| {
                    TransportError::Other(format!("{} could not provide state", peer_id))
                });
                let _ = pending.reply.send(result);
            }
        }
    }

    fn on_handshake(
        &mut self,
        conn_id: u64,
        peer_id: String,
        address: Option<String>,
        groups: Vec<GroupMembership>,
    ) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };

        if peer_id == self.peer_id {
            debug!("conn-{} leads back to ourselves, closing", conn_id);
            if let Some(address) = &conn.dialed {
                self.self_addresses.insert(address.clone());
            }
            conn.handle.close();
            self.connections.remove(&conn_id);
            return;
        }
        conn.peer_id = Some(peer_id.clone());

        let groups: HashMap<String, u64> =
            groups.into_iter().map(|m| (m.group, m.joined_at)).collect();
        let mut changed: HashSet<String> = groups.keys().cloned().collect();

        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                debug!("Additional connection conn-{} to {}", conn_id, peer_id);
                peer.conns.push(conn_id);
                if address.is_some() {
                    peer.address = address;
                }
                changed.extend(peer.groups.keys().cloned());
                peer.groups = groups;
            }
            None => {
                info!(
                    "Peer connected: {} (address: {:?})",
                    peer_id,
                    address.as_deref()
                );
                self.peers.insert(
                    peer_id,
                    Peer {
                        address,
                        groups,
                        conns: vec![conn_id],
                    },
                );
            }
        }

        for group in changed {
            self.refresh_view(&group);
        }
    }

    fn on_state_request(&mut self, conn_id: u64, peer_id: String, group: String, request_id: u64) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let sender = conn.handle.sender();

        let Some(local) = self.groups.get(&group) else {
            let _ = sender.send(&Frame::StateResponse {
                group,
                request_id,
                state: None,
            });
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = local.events.send(GroupEvent::StateRequested {
            requester: peer_id,
            reply: reply_tx,
        });

        tokio::spawn(async move {
            let state = reply_rx.await.ok();
            let _ = sender.send(&Frame::StateResponse {
                group,
                request_id,
                state,
            });
        });
    }

    // ==================== Groups ====================

    fn on_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join { group, reply } => {
                let _ = reply.send(self.join(group));
            }
            HubCommand::Leave { group, reply } => {
                self.leave(&group);
                let _ = reply.send(());
            }
            HubCommand::Send {
                group,
                payload,
                reply,
            } => {
                let _ = reply.send(self.broadcast(&group, payload));
            }
            HubCommand::RequestState { group, reply } => self.request_state(group, reply),
            HubCommand::Peers { reply } => {
                let mut peers: Vec<String> = self.peers.keys().cloned().collect();
                peers.sort();
                let _ = reply.send(peers);
            }
            // Handled by the run loop
            HubCommand::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn join(&mut self, group: String) -> Result<GroupEvents> {
        if self.groups.contains_key(&group) {
            return Err(TransportError::ConnectionFailed(format!(
                "already joined {}",
                group
            )));
        }

        let joined_at = unix_time_ms();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.groups.insert(
            group.clone(),
            LocalGroup {
                joined_at,
                events: events_tx,
                view: View::default(),
            },
        );
        info!("Joined group {}", group);

        // Pending connections too: their handshake predates this join
        self.send_to_all(&Frame::Join {
            group: group.clone(),
            joined_at,
        });
        self.refresh_view(&group);
        Ok(events_rx)
    }

    fn leave(&mut self, group: &str) {
        if self.groups.remove(group).is_none() {
            return;
        }
        info!("Left group {}", group);
        self.send_to_all(&Frame::Leave {
            group: group.to_string(),
        });
    }

    /// Deliver locally, then to every peer in the group.
    fn broadcast(&mut self, group: &str, payload: Vec<u8>) -> Result<()> {
        let Some(local) = self.groups.get(group) else {
            return Err(TransportError::Closed);
        };

        let frame = Frame::Deliver {
            group: group.to_string(),
            payload: payload.clone(),
        };
        for (peer_id, peer) in &self.peers {
            if !peer.groups.contains_key(group) {
                continue;
            }
            if let Err(e) = self.send_to_peer(peer_id, peer, &frame) {
                warn!("Failed to deliver to {}: {}", peer_id, e);
            }
        }

        let _ = local.events.send(GroupEvent::Delivered {
            from: self.peer_id.clone(),
            payload,
        });
        Ok(())
    }

    fn request_state(&mut self, group: String, reply: oneshot::Sender<Result<Vec<u8>>>) {
        let Some(local) = self.groups.get(&group) else {
            let _ = reply.send(Err(TransportError::Closed));
            return;
        };

        if self.bootstrapping {
            debug!("Holding state request for {} until seed connections settle", group);
            self.held_state.push((group, reply));
            return;
        }

        let provider = local
            .view
            .members
            .iter()
            .find(|m| **m != self.peer_id)
            .cloned();
        let Some(provider) = provider else {
            let _ = reply.send(Err(TransportError::NoStateProvider));
            return;
        };
        let Some(peer) = self.peers.get(&provider) else {
            let _ = reply.send(Err(TransportError::NoStateProvider));
            return;
        };

        // Forget requests whose caller already gave up
        self.pending_state.retain(|_, p| !p.reply.is_closed());

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let frame = Frame::StateRequest {
            group,
            request_id,
        };
        if let Err(e) = self.send_to_peer(&provider, peer, &frame) {
            let _ = reply.send(Err(TransportError::SendFailed(e.to_string())));
            return;
        }

        debug!("Requested state from {} (request {})", provider, request_id);
        self.pending_state
            .insert(request_id, PendingState { provider, reply });
    }

    /// Recompute the view of a locally joined group and publish it if the
    /// member list changed.
    fn refresh_view(&mut self, group: &str) {
        let Some(local) = self.groups.get_mut(group) else {
            return;
        };

        let mut members: Vec<(u64, &str)> = vec![(local.joined_at, self.peer_id.as_str())];
        members.extend(
            self.peers
                .iter()
                .filter_map(|(id, p)| p.groups.get(group).map(|at| (*at, id.as_str()))),
        );
        members.sort();
        let members: Vec<String> = members.into_iter().map(|(_, id)| id.to_string()).collect();

        if members == local.view.members {
            return;
        }
        local.view = View::new(local.view.id + 1, members);
        debug!("New view for {}: {}", group, local.view);
        let _ = local
            .events
            .send(GroupEvent::ViewChanged(local.view.clone()));
    }

    // ==================== Sending ====================

    /// Send on the connection opened by the lower peer ID, or any other.
    fn send_to_peer(&self, peer_id: &str, peer: &Peer, frame: &Frame) -> anyhow::Result<()> {
        let lower_is_us = self.peer_id.as_str() < peer_id;
        let preferred = peer
            .conns
            .iter()
            .filter_map(|id| self.connections.get(id))
            .max_by_key(|c| c.dialed.is_some() == lower_is_us)
            .ok_or_else(|| anyhow::anyhow!("No open connection to {}", peer_id))?;
        preferred.handle.send(frame)
    }

    fn send_to_all(&self, frame: &Frame) {
        for conn in self.connections.values() {
            if let Err(e) = conn.handle.send(frame) {
                debug!("Failed to send {} on conn-{}: {}", frame.kind(), conn.handle.conn_id(), e);
            }
        }
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
