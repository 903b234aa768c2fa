//! Session lifecycle: join, state transfer, chat loop, leave.
//!
//! A `Session` owns the chat store, the failure detector and both group
//! channels. Everything that touches the store or detector runs on the task
//! that drives [`Session::run`], so they need no locking.
//!
//! ```text
//! Disconnected -> Joining -> Syncing -> Active -> Leaving -> Closed
//! ```

use crate::command::{Command, DEFAULT_DISPLAY_NAME};
use crate::emitter::HeartbeatEmitter;
use crate::events::{ChatEvent, EventBus};
use crate::failure::{FailureDetector, FailureDetectorConfig, FailureEvent};
use crate::protocol::{ChatMessage, Heartbeat};
use crate::store::{ChatStore, StoreError};
use crate::transport::{
    GroupChannel, GroupEvent, GroupEvents, GroupTransport, TransportError, View,
};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default chat group name.
pub const DEFAULT_CHAT_GROUP: &str = "ChatCluster";
/// Default heartbeat group name.
pub const DEFAULT_HEARTBEAT_GROUP: &str = "HeartbeatChannel";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Joining,
    Syncing,
    Active,
    Leaving,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Joining)
                | (Disconnected, Closed)
                | (Joining, Syncing)
                | (Joining, Leaving)
                | (Syncing, Active)
                | (Syncing, Leaving)
                | (Active, Leaving)
                | (Leaving, Closed)
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Joining => "joining",
            SessionState::Syncing => "syncing",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name shown next to our messages
    pub display_name: String,
    /// Group carrying chat messages and state transfer
    pub chat_group: String,
    /// Group carrying heartbeats only
    pub heartbeat_group: String,
    /// Heartbeat period and suspicion timeout
    pub detector: FailureDetectorConfig,
    /// Upper bound on the initial state transfer (default: 10s)
    pub state_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            chat_group: DEFAULT_CHAT_GROUP.to_string(),
            heartbeat_group: DEFAULT_HEARTBEAT_GROUP.to_string(),
            detector: FailureDetectorConfig::default(),
            state_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to group {group}: {source}")]
    Connect {
        group: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to restore chat history: {0}")]
    Restore(#[from] StoreError),

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
}

/// One node's participation in the chat and heartbeat groups.
pub struct Session {
    config: SessionConfig,
    events: Arc<EventBus>,
    state: SessionState,
    local_id: String,
    store: ChatStore,
    detector: FailureDetector,
    view: View,
    chat: Option<Arc<dyn GroupChannel>>,
    chat_events: Option<GroupEvents>,
    heartbeat: Option<Arc<dyn GroupChannel>>,
    heartbeat_events: Option<GroupEvents>,
    emitter: Option<HeartbeatEmitter>,
    /// Origin of the detector clock
    started: Instant,
}

impl Session {
    pub fn new(config: SessionConfig, events: Arc<EventBus>) -> Self {
        let detector = FailureDetector::new(config.detector.clone());
        Self {
            config,
            events,
            state: SessionState::Disconnected,
            local_id: String::new(),
            store: ChatStore::new(),
            detector,
            view: View::default(),
            chat: None,
            chat_events: None,
            heartbeat: None,
            heartbeat_events: None,
            emitter: None,
            started: Instant::now(),
        }
    }

    /// Start from pre-existing local history.
    ///
    /// Kept when no snapshot can be fetched; replaced when one is.
    pub fn with_store(mut self, store: ChatStore) -> Self {
        self.store = store;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Transport identifier of this node (empty before `join`).
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Last membership view of the chat group.
    pub fn view(&self) -> &View {
        &self.view
    }

    /// Connect both groups, fetch history and start heartbeating.
    ///
    /// On success the session is `Active`. A failed connection or an
    /// undecodable snapshot closes whatever was opened and leaves the
    /// session `Closed`.
    pub async fn join(&mut self, transport: &dyn GroupTransport) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                action: "join",
                state: self.state,
            });
        }

        self.local_id = transport.local_id().to_string();
        self.set_state(SessionState::Joining);

        let group = self.config.chat_group.clone();
        let (chat, chat_events) = match transport.connect(&group).await {
            Ok(connected) => connected,
            Err(source) => {
                error!("Failed to join {}: {}", group, source);
                self.leave().await;
                return Err(SessionError::Connect { group, source });
            }
        };
        self.chat = Some(Arc::clone(&chat));
        self.chat_events = Some(chat_events);

        self.set_state(SessionState::Syncing);
        if let Err(e) = self.sync_history(chat.as_ref()).await {
            error!("Aborting join: {}", e);
            self.leave().await;
            return Err(e);
        }

        let group = self.config.heartbeat_group.clone();
        let (heartbeat, heartbeat_events) = match transport.connect(&group).await {
            Ok(connected) => connected,
            Err(source) => {
                error!("Failed to join {}: {}", group, source);
                self.leave().await;
                return Err(SessionError::Connect { group, source });
            }
        };
        self.emitter = Some(HeartbeatEmitter::start(
            Arc::clone(&heartbeat),
            self.config.detector.heartbeat_interval,
        ));
        self.heartbeat = Some(heartbeat);
        self.heartbeat_events = Some(heartbeat_events);

        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Request the current history from another member.
    async fn sync_history(&mut self, chat: &dyn GroupChannel) -> Result<(), SessionError> {
        match chat.request_state(self.config.state_timeout).await {
            Ok(bytes) => {
                self.store.restore(&bytes)?;
                info!("Restored chat history ({} entries)", self.store.len());
                self.events.emit(ChatEvent::HistoryRestored {
                    lines: self.store.lines(),
                });
            }
            Err(TransportError::NoStateProvider) => {
                info!(
                    "No other members in {}, starting with local history",
                    chat.group()
                );
            }
            Err(e) => {
                warn!("State transfer failed, continuing with local history: {}", e);
                self.events.emit(ChatEvent::DegradedStart {
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Drive the session until `quit`/`exit` or until `input` closes.
    ///
    /// Returns once the session is `Closed`.
    pub async fn run(
        &mut self,
        mut input: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), SessionError> {
        let (Some(mut chat_events), Some(mut heartbeat_events)) =
            (self.chat_events.take(), self.heartbeat_events.take())
        else {
            return Err(SessionError::InvalidState {
                action: "run",
                state: self.state,
            });
        };

        let mut sweeper = tokio::time::interval(self.config.detector.heartbeat_interval);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = input.recv() => match line {
                    Some(line) => {
                        if self.handle_line(&line).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        info!("Input closed, leaving");
                        break;
                    }
                },
                Some(event) = chat_events.recv() => self.on_chat_event(event),
                Some(event) = heartbeat_events.recv() => self.on_heartbeat_event(event),
                _ = sweeper.tick() => self.sweep(),
            }
        }

        self.leave().await;
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> ControlFlow<()> {
        match Command::parse(line) {
            Command::Quit => return ControlFlow::Break(()),
            Command::Empty => {}
            Command::Say(text) => self.say(&text).await,
        }
        ControlFlow::Continue(())
    }

    /// Broadcast one line on the chat group.
    async fn say(&self, text: &str) {
        let Some(chat) = &self.chat else {
            return;
        };

        let message = ChatMessage::new(&self.config.display_name, text);
        if let Err(e) = chat.send(&message.to_json()).await {
            warn!("Failed to send message on {}: {}", chat.group(), e);
            self.events.emit(ChatEvent::SendFailed {
                group: chat.group().to_string(),
                error: e.to_string(),
            });
        }
    }

    fn on_chat_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Delivered { from, payload } => {
                let Some(message) = ChatMessage::from_json(&payload) else {
                    debug!("Ignoring malformed chat payload from {}", from);
                    return;
                };
                let text = message.rendered();
                let line = self.store.put(&from, &text);
                debug!("Stored message from {}", from);
                self.events.emit(ChatEvent::MessageReceived {
                    author: from,
                    text,
                    line,
                });
            }
            GroupEvent::ViewChanged(view) => {
                info!("** view: {}", view);
                self.events.emit(ChatEvent::ViewChanged {
                    view_id: view.id,
                    members: view.members.clone(),
                });
                self.view = view;
            }
            GroupEvent::StateRequested { requester, reply } => match self.store.snapshot() {
                Ok(bytes) => {
                    debug!(
                        "Sending chat history to {} ({} entries)",
                        requester,
                        self.store.len()
                    );
                    if reply.send(bytes).is_err() {
                        debug!("{} stopped waiting for chat history", requester);
                    }
                }
                Err(e) => error!("Failed to snapshot chat history for {}: {}", requester, e),
            },
        }
    }

    fn on_heartbeat_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Delivered { from, payload } => {
                if Heartbeat::from_json(&payload).is_none() {
                    debug!("Ignoring malformed heartbeat from {}", from);
                    return;
                }
                let now = self.now_ms();
                if let Some(FailureEvent::NodeUp { node_id }) =
                    self.detector.receive_heartbeat(&from, now)
                {
                    info!("Node {} is up", node_id);
                    self.events.emit(ChatEvent::NodeUp { node_id });
                }
                self.sweep();
            }
            GroupEvent::ViewChanged(view) => {
                debug!("Heartbeat view: {}", view);
            }
            GroupEvent::StateRequested { requester, .. } => {
                debug!("{} asked for heartbeat state, ignoring", requester);
            }
        }
    }

    /// Report every node silent past the timeout.
    fn sweep(&mut self) {
        let now = self.now_ms();
        for event in self.detector.sweep(now) {
            if let FailureEvent::NodeDown { node_id, last_seen } = event {
                warn!("Node {} is down.", node_id);
                self.events.emit(ChatEvent::NodeDown {
                    node_id,
                    last_seen_ms: last_seen,
                });
            }
        }
    }

    /// Stop heartbeating and close both groups.
    ///
    /// The emitter has finished, in-flight heartbeat included, before the
    /// session reports `Leaving`. Safe to call in any state; a `Closed`
    /// session is left as is.
    pub async fn leave(&mut self) {
        match self.state {
            SessionState::Closed => return,
            SessionState::Disconnected => {
                self.set_state(SessionState::Closed);
                return;
            }
            _ => {}
        }

        if let Some(mut emitter) = self.emitter.take() {
            emitter.stop().await;
            debug!("Heartbeat emitter sent {} heartbeat(s)", emitter.sent_count());
        }
        if self.state != SessionState::Leaving {
            self.set_state(SessionState::Leaving);
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            if let Err(e) = heartbeat.close().await {
                warn!("Failed to close {}: {}", heartbeat.group(), e);
            }
        }
        if let Some(chat) = self.chat.take() {
            if let Err(e) = chat.close().await {
                warn!("Failed to close {}: {}", chat.group(), e);
            }
        }
        self.chat_events = None;
        self.heartbeat_events = None;

        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, next: SessionState) {
        let from = self.state;
        debug_assert!(
            from.can_transition_to(next),
            "illegal transition {} -> {}",
            from,
            next
        );
        self.state = next;
        debug!("Session {} -> {}", from, next);
        self.events
            .emit(ChatEvent::StateChanged { from, to: next });
    }

    /// Milliseconds since the session was created, on Tokio's clock.
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
