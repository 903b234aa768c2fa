//! Individual peer connection management.
//!
//! Each connection wraps a WebSocket stream split into a read task, which
//! parses frames and forwards them to the hub, and a write task, which
//! drains an outgoing queue. Inbound (accepted) and outbound (dialed)
//! streams share this type.

use crate::message::{Frame, MAX_MESSAGE_SIZE};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

/// Event emitted by a connection (or by the task establishing it).
pub enum ConnectionEvent {
    /// WebSocket upgrade finished; `dialed` is the address we dialed, or
    /// `None` for an accepted connection
    Opened {
        conn: PeerConnection,
        dialed: Option<String>,
    },
    /// Outbound connection attempt failed
    DialFailed { address: String, error: String },
    /// Received a frame
    Frame { conn_id: u64, frame: Frame },
    /// Connection was closed
    Closed { conn_id: u64 },
}

/// Cloneable handle for queueing frames on a connection.
#[derive(Clone)]
pub struct FrameSender {
    conn_id: u64,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl FrameSender {
    /// Queue a frame. Fails once the write task has stopped.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.outgoing
            .send(Message::Binary(frame.to_binary().into()))
            .map_err(|_| anyhow!("Connection {} is closed", self.conn_id))
    }
}

/// A single WebSocket connection to a peer.
pub struct PeerConnection {
    conn_id: u64,
    sender: FrameSender,
    read_task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Create a new peer connection from a WebSocket stream.
    ///
    /// Spawns the read and write tasks. Frames go to `event_tx`.
    pub fn new<S>(
        conn_id: u64,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        // Ends by itself once every sender is dropped
        tokio::spawn(Self::write_loop(conn_id, write, outgoing_rx));

        let read_task = tokio::spawn(Self::read_loop(conn_id, read, event_tx));

        Self {
            conn_id,
            sender: FrameSender {
                conn_id,
                outgoing: outgoing_tx,
            },
            read_task: Some(read_task),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.sender.send(frame)
    }

    /// Ask the write task to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.sender.outgoing.send(Message::Close(None));
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop<S>(
        conn_id: u64,
        mut read: SplitStream<WebSocketStream<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame on conn-{}", conn_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    // Check message size
                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message on conn-{} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match Frame::from_binary(&data) {
                        Some(frame) => {
                            if event_tx.send(ConnectionEvent::Frame { conn_id, frame }).is_err() {
                                // Hub is gone
                                return;
                            }
                        }
                        None => {
                            debug!(
                                "Dropping unrecognised {} byte message on conn-{}",
                                data.len(),
                                conn_id
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection conn-{} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on conn-{}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection conn-{} stream ended", conn_id);
                    break;
                }
            }
        }

        // Notify that connection is closed
        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Write loop draining the outgoing queue.
    async fn write_loop<S>(
        conn_id: u64,
        mut write: SplitSink<WebSocketStream<S>, Message>,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = outgoing.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Write on conn-{} failed: {}", conn_id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
