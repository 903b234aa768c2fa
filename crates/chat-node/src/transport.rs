//! WebSocket mesh implementation of `GroupTransport`.
//!
//! Every node listens for WebSocket connections and dials its seeds. Peers
//! exchange the addresses they know, so the mesh fills in without every
//! node listing every other. All state lives in the hub task; the handles
//! here only send it commands.

use crate::hub::{Hub, HubCommand};
use anyhow::Result;
use async_trait::async_trait;
use chat_core::transport::{self, GroupChannel, GroupEvents, GroupTransport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for [`WsTransport::start`].
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Our node identifier
    pub peer_id: String,
    /// Address to bind, e.g. `127.0.0.1:7800` (port 0 picks a free one)
    pub listen: String,
    /// URL other nodes should dial; defaults to `ws://<bound address>`
    pub advertise: Option<String>,
    /// Addresses to dial at startup
    pub seeds: Vec<String>,
    /// How often unreachable seeds are retried (default: 5s)
    pub redial_interval: Duration,
}

impl WsTransportConfig {
    pub fn new(peer_id: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            listen: listen.into(),
            advertise: None,
            seeds: Vec::new(),
            redial_interval: Duration::from_secs(5),
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }
}

/// Handle to a running mesh node.
pub struct WsTransport {
    peer_id: String,
    local_addr: SocketAddr,
    address: String,
    commands: mpsc::UnboundedSender<HubCommand>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// Bind the listener and start the hub on the current runtime.
    pub async fn start(config: WsTransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        let local_addr = listener.local_addr()?;
        let address = config
            .advertise
            .clone()
            .unwrap_or_else(|| format!("ws://{}", local_addr));
        info!(
            "Node {} listening on {} (advertised as {})",
            config.peer_id, local_addr, address
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(config.peer_id.clone(), address.clone(), config.seeds);
        let task = tokio::spawn(hub.run(listener, commands_rx, config.redial_interval));

        Ok(Self {
            peer_id: config.peer_id,
            local_addr,
            address,
            commands: commands_tx,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL other nodes use to reach us.
    pub fn advertised_address(&self) -> &str {
        &self.address
    }

    /// Connected peer IDs, sorted.
    pub async fn peers(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Peers { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Wait until at least `count` peers are connected.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.peers().await.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Close every connection and stop the hub.
    pub async fn shutdown(mut self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl GroupTransport for WsTransport {
    fn local_id(&self) -> &str {
        &self.peer_id
    }

    async fn connect(
        &self,
        group: &str,
    ) -> transport::Result<(Arc<dyn GroupChannel>, GroupEvents)> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Join {
                group: group.to_string(),
                reply,
            })
            .map_err(|_| TransportError::ConnectionFailed("transport stopped".into()))?;

        let events = rx
            .await
            .map_err(|_| TransportError::ConnectionFailed("transport stopped".into()))??;

        let channel = WsChannel {
            group: group.to_string(),
            peer_id: self.peer_id.clone(),
            commands: self.commands.clone(),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(channel), events))
    }
}

/// Membership of this node in one mesh group.
pub struct WsChannel {
    group: String,
    peer_id: String,
    commands: mpsc::UnboundedSender<HubCommand>,
    closed: AtomicBool,
}

impl WsChannel {
    /// Send a command whose reply is itself a transport result.
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<transport::Result<T>>) -> HubCommand,
    ) -> transport::Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl GroupChannel for WsChannel {
    fn group(&self) -> &str {
        &self.group
    }

    fn local_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let group = self.group.clone();
        let payload = payload.to_vec();
        self.call(|reply| HubCommand::Send {
            group,
            payload,
            reply,
        })
        .await
    }

    async fn request_state(&self, timeout: Duration) -> transport::Result<Vec<u8>> {
        let group = self.group.clone();
        let request = self.call(|reply| HubCommand::RequestState { group, reply });

        match tokio::time::timeout(timeout, request).await {
            Ok(Err(TransportError::Closed)) => Err(TransportError::Other(
                "state provider went away".into(),
            )),
            Ok(result) => result,
            Err(_) => Err(TransportError::StateTimeout(timeout)),
        }
    }

    async fn close(&self) -> transport::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Leave {
                group: self.group.clone(),
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
        Ok(())
    }
}
