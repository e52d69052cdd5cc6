//! Connecting-side runtime: one tokio task per session drives a [`Connector`].

use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::error::SessionError;
use crate::session::{
    CloseReason, Effect, IoEvent, SessionCommand, SessionConfig, SessionEvent, SessionHandle,
    SessionStats,
};
use crate::transport::{connect_tcp, FrameSink, TcpTransport, Transport, TransportId};
use link_wire::Frame;

/// Entry point for opening sessions to a link server
pub struct Client;

impl Client {
    /// Open session `session_id` to `addr`.
    ///
    /// Resolves once the first handshake succeeds. The session then survives
    /// transport loss on its own until it is closed.
    pub async fn connect(
        config: SessionConfig,
        addr: SocketAddr,
        session_id: u64,
    ) -> Result<SessionHandle, SessionError> {
        config.validate()?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = oneshot::channel();

        let handle = SessionHandle::new(session_id, &config, command_tx, event_rx);
        let actor = ConnectorActor {
            connector: Connector::new(session_id, config.clone(), Instant::now()),
            config,
            addr,
            io_tx,
            io_rx,
            commands,
            events: event_tx,
            established: Some(established_tx),
            stats: SessionStats::default(),
        };
        tokio::spawn(actor.run());

        match established_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(reason)) => Err(SessionError::ConnectFailed(reason)),
            Err(_) => Err(SessionError::Closed),
        }
    }

    /// Open a session with a freshly generated identity
    pub async fn connect_new(
        config: SessionConfig,
        addr: SocketAddr,
    ) -> Result<SessionHandle, SessionError> {
        let session_id = rand::thread_rng().gen::<u64>();
        Self::connect(config, addr, session_id).await
    }
}

/// Forwards everything read from a connector-owned transport to the session task
struct MailboxSink {
    mailbox: mpsc::UnboundedSender<IoEvent>,
}

impl FrameSink for MailboxSink {
    fn on_frame(&mut self, transport: &TcpTransport, frame: Frame) -> bool {
        self.mailbox
            .send(IoEvent::Frame {
                transport: transport.id(),
                frame,
            })
            .is_ok()
    }

    fn on_lost(&mut self, transport: TransportId) {
        let _ = self.mailbox.send(IoEvent::Lost { transport });
    }
}

struct ConnectorActor {
    connector: Connector<TcpTransport>,
    config: SessionConfig,
    addr: SocketAddr,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    established: Option<oneshot::Sender<Result<(), CloseReason>>>,
    stats: SessionStats,
}

impl ConnectorActor {
    async fn run(mut self) {
        let session_id = self.connector.session_id();
        info!("Session {} connecting to {}", session_id, self.addr);

        let mut effects = Vec::new();
        self.connector.start(Instant::now(), &mut effects);
        let mut closed = self.apply(effects);

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !closed {
            let mut effects = Vec::new();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send(payload)) => self.send(payload, &mut effects),
                    Some(SessionCommand::Close) | None => self.connector.close_local(&mut effects),
                },
                Some(event) = self.io_rx.recv() => self.on_io(event, &mut effects),
                _ = tick.tick() => self.connector.tick(Instant::now(), &mut effects),
            }
            closed = self.apply(effects);
        }

        info!("Session {} ended. Stats: {:?}", session_id, self.stats);
    }

    fn send(&mut self, payload: Bytes, effects: &mut Vec<Effect>) {
        self.stats.messages_sent += 1;
        self.connector.send(payload, Instant::now(), effects);
    }

    fn on_io(&mut self, event: IoEvent, effects: &mut Vec<Effect>) {
        let now = Instant::now();
        match event {
            IoEvent::Frame { transport, frame } => {
                self.stats.frames_received += 1;
                self.connector.on_frame(transport, frame, now, effects);
            }
            IoEvent::Lost { transport } => self.connector.on_lost(transport, now, effects),
            IoEvent::Dialed { attempt, result } => {
                let transport = match result {
                    Ok(stream) => {
                        let sink = MailboxSink {
                            mailbox: self.io_tx.clone(),
                        };
                        match TcpTransport::spawn(stream, &self.config, sink) {
                            Ok(transport) => Some(transport),
                            Err(e) => {
                                warn!("Failed to set up connection to {}: {}", self.addr, e);
                                None
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Dial {} to {} failed: {}", attempt, self.addr, e);
                        None
                    }
                };
                if transport.is_some() && self.established.is_none() {
                    self.stats.rebinds += 1;
                }
                self.connector.on_dialed(attempt, transport, now, effects);
            }
            IoEvent::Connect { transport, .. } => {
                // Only the accepting side routes handshakes by session
                transport.close();
            }
        }
    }

    /// Apply effects in order; returns true once the session has closed
    fn apply(&mut self, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::Dial { attempt } => self.dial(attempt),
                Effect::Deliver(payload) => {
                    if !payload.is_heartbeat() {
                        self.stats.messages_delivered += 1;
                    }
                    let _ = self.events.send(SessionEvent::from(payload));
                }
                Effect::Established => {
                    if let Some(established) = self.established.take() {
                        let _ = established.send(Ok(()));
                    }
                }
                Effect::Closed(reason) => {
                    if let Some(established) = self.established.take() {
                        let _ = established.send(Err(reason));
                    }
                    let _ = self.events.send(SessionEvent::Closed(reason));
                    return true;
                }
            }
        }
        false
    }

    fn dial(&self, attempt: u64) {
        let mailbox = self.io_tx.clone();
        let addr = self.addr;
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connect_tcp(addr)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )),
            };
            let _ = mailbox.send(IoEvent::Dialed { attempt, result });
        });
    }
}
