//! Link session binary.
//!
//! `listen` runs an echo server: every message a session receives is sent
//! back on the same session. `connect` opens a session, sends each line read
//! from stdin and prints what comes back. Sessions survive dropped TCP
//! connections, so killing and re-establishing the network path between the
//! two does not lose or duplicate lines.

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use link_session::{Client, Server, SessionEvent, SessionHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::LinkConfig;
use logging::LinkLogFormatter;

/// Reconnectable, ordered message sessions over TCP
#[derive(Parser, Debug)]
#[command(name = "redb-link", version, about = "Reconnectable ordered message sessions over TCP")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Heartbeat interval, e.g. 10s
    #[arg(long, global = true)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Time the peer has to acknowledge a message, e.g. 30s
    #[arg(long, global = true)]
    ack_timeout: Option<humantime::Duration>,

    /// Send window in messages
    #[arg(long, global = true)]
    max_pending_messages: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept sessions and echo every message back
    Listen {
        /// Listen address, e.g. 0.0.0.0:7400
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Server-side idle timeout, e.g. 60s
        #[arg(long)]
        idle_timeout: Option<humantime::Duration>,
    },
    /// Open a session and exchange stdin lines with the server
    Connect {
        /// Server address, e.g. 127.0.0.1:7400
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Session identity; a random one is generated when omitted
        #[arg(long)]
        session_id: Option<u64>,

        /// Dial attempts per reconnection
        #[arg(long)]
        max_connect_times: Option<u32>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_link={}", args.log_level).parse()?)
        .add_directive(format!("link_session={}", args.log_level).parse()?)
        .add_directive(format!("link_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(LinkLogFormatter::new("link"))
        .init();

    info!("Starting reDB Link v{}", env!("CARGO_PKG_VERSION"));

    let mut config = LinkConfig::load_from_file(&args.config)?;
    if let Some(interval) = args.heartbeat_interval {
        config.session.heartbeat_interval = interval.into();
    }
    if let Some(timeout) = args.ack_timeout {
        config.session.ack_timeout = timeout.into();
    }
    if let Some(window) = args.max_pending_messages {
        config.session.max_pending_messages = window;
    }

    match args.command {
        Command::Listen { addr, idle_timeout } => {
            if let Some(addr) = addr {
                config.listen_addr = addr;
            }
            if let Some(timeout) = idle_timeout {
                config.session.idle_timeout = timeout.into();
            }
            config.session.validate()?;
            run_echo_server(config).await
        }
        Command::Connect {
            addr,
            session_id,
            max_connect_times,
        } => {
            if let Some(addr) = addr {
                config.connect_addr = addr;
            }
            if session_id.is_some() {
                config.session_id = session_id;
            }
            if let Some(times) = max_connect_times {
                config.session.max_connect_times = times;
            }
            config.session.validate()?;
            run_client(config).await
        }
    }
}

async fn run_echo_server(config: LinkConfig) -> anyhow::Result<()> {
    let mut server = Server::bind(config.session.clone(), config.listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;
    component_info!("server", "Echo server ready on {}", server.local_addr());

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Some(session) => {
                    component_info!(
                        "server",
                        "Session {} opened ({} live)",
                        session.session_id(),
                        server.session_count()
                    );
                    tokio::spawn(echo(session));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }
        }
    }

    info!("Link server shutdown complete");
    Ok(())
}

async fn echo(mut session: SessionHandle) {
    let session_id = session.session_id();
    let mut echoed: u64 = 0;

    while let Some(event) = session.recv().await {
        match event {
            SessionEvent::Message(data) => {
                if let Err(e) = session.send(data) {
                    component_warn!("server", "Session {} cannot echo: {}", session_id, e);
                    break;
                }
                echoed += 1;
            }
            SessionEvent::Heartbeat => {
                component_debug!("server", "Session {} heartbeat", session_id);
            }
            SessionEvent::Closed(reason) => {
                component_info!(
                    "server",
                    "Session {} closed: {} after {} messages",
                    session_id,
                    reason,
                    echoed
                );
                return;
            }
        }
    }
}

async fn run_client(config: LinkConfig) -> anyhow::Result<()> {
    let addr = config.connect_addr;
    let session = match config.session_id {
        Some(session_id) => Client::connect(config.session, addr, session_id).await,
        None => Client::connect_new(config.session, addr).await,
    }
    .with_context(|| format!("Failed to open a session to {}", addr))?;

    let session_id = session.session_id();
    component_info!("client", "Session {} established with {}", session_id, addr);

    let (sender, mut events) = session.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => sender.send(Bytes::from(line))?,
                None => {
                    // Keep reading replies briefly, then close
                    stdin_open = false;
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        sender.close();
                    });
                }
            },
            event = events.recv() => match event {
                Some(SessionEvent::Message(data)) => {
                    stdout.write_all(&data).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
                Some(SessionEvent::Heartbeat) => {
                    component_debug!("client", "Session {} heartbeat", session_id);
                }
                Some(SessionEvent::Closed(reason)) => {
                    component_info!("client", "Session {} closed: {}", session_id, reason);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT signal, closing session {}", session_id);
                sender.close();
            }
        }
    }

    Ok(())
}
