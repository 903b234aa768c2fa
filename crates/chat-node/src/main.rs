//! chat-node: interactive group chat over a WebSocket mesh.
//!
//! Joins the chat group, pulls history from the oldest member, and prints
//! every message and membership change. Lines typed on stdin are broadcast;
//! `quit` or `exit` leaves.

use anyhow::Result;
use chat_core::{
    ChatEvent, EventBus, FailureDetectorConfig, Session, SessionConfig, View, display_name,
};
use chat_node::{WsTransport, WsTransportConfig};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-node")]
#[command(about = "Membership-aware group chat node")]
struct Args {
    /// Address to listen on for peer connections
    #[arg(short, long, default_value = "127.0.0.1:7800")]
    listen: String,

    /// Address peers should dial to reach us (default: ws://<listen>)
    #[arg(long)]
    advertise: Option<String>,

    /// Peer to connect to at startup (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Display name (prompted for if not provided)
    #[arg(short, long)]
    name: Option<String>,

    /// Node ID (generated if not provided)
    #[arg(long)]
    node_id: Option<String>,

    /// Chat group name
    #[arg(long, default_value = "ChatCluster")]
    cluster: String,

    /// Heartbeat group name
    #[arg(long, default_value = "HeartbeatChannel")]
    heartbeat_group: String,

    /// How long to wait for chat history when joining
    #[arg(long, default_value_t = 10_000)]
    state_timeout_ms: u64,

    /// Heartbeat period
    #[arg(long, default_value_t = 1_000)]
    heartbeat_interval_ms: u64,

    /// Silence after which a node is reported down
    #[arg(long, default_value_t = 3_000)]
    failure_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Print session events the way the chat shows them.
fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::MessageReceived { line, .. } => println!("{}", line),
        ChatEvent::HistoryRestored { lines } => {
            println!("Chat history (key-value pairs):");
            for line in lines {
                println!("{}", line);
            }
        }
        ChatEvent::ViewChanged { view_id, members } => {
            println!("** view: {}", View::new(view_id, members.clone()));
            for member in members {
                println!("Member: {}", member);
            }
        }
        ChatEvent::NodeDown { node_id, .. } => println!("Node {} is down.", node_id),
        ChatEvent::DegradedStart { reason } => {
            println!("Could not fetch chat history ({}), continuing without it", reason)
        }
        ChatEvent::SendFailed { error, .. } => println!("Message not sent: {}", error),
        ChatEvent::StateChanged { .. } | ChatEvent::NodeUp { .. } => {}
    }
}

/// Read one line, skipping input that is not UTF-8.
///
/// Returns `None` at end of input.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => return Ok(Some(line)),
            Err(_) => debug!("Skipping line that is not valid UTF-8"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,chat_node=debug,chat_core=debug"
    } else {
        "info,chat_node=info,chat_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut stdin = BufReader::new(tokio::io::stdin());

    let name = match args.name {
        Some(name) => display_name(&name),
        None => {
            print!("Enter your name: ");
            std::io::stdout().flush()?;
            display_name(&read_line(&mut stdin).await?.unwrap_or_default())
        }
    };

    // Generate node ID if not provided
    let node_id = args.node_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated node ID: {}", id);
        id
    });

    let transport = WsTransport::start(WsTransportConfig {
        advertise: args.advertise,
        seeds: args.peers,
        ..WsTransportConfig::new(node_id, args.listen)
    })
    .await?;

    let bus = Arc::new(EventBus::new());
    let _printer = bus.subscribe(print_event);

    let config = SessionConfig {
        display_name: name,
        chat_group: args.cluster,
        heartbeat_group: args.heartbeat_group,
        detector: FailureDetectorConfig {
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            timeout: Duration::from_millis(args.failure_timeout_ms),
        },
        state_timeout: Duration::from_millis(args.state_timeout_ms),
    };
    let mut session = Session::new(config, Arc::clone(&bus));
    session.join(&transport).await?;

    println!("Type a message and press enter. 'quit' or 'exit' leaves.");

    let (input_tx, input_rx) = mpsc::unbounded_channel();

    let stdin_tx = input_tx.clone();
    tokio::spawn(async move {
        loop {
            match read_line(&mut stdin).await {
                Ok(Some(line)) => {
                    if stdin_tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    // End of input leaves like `quit`
                    let _ = stdin_tx.send("quit".to_string());
                    break;
                }
                Err(e) => {
                    debug!("Stopped reading input: {}", e);
                    let _ = stdin_tx.send("quit".to_string());
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = input_tx.send("quit".to_string());
        }
    });

    session.run(input_rx).await?;

    info!("Shutting down");
    transport.shutdown().await;
    Ok(())
}
