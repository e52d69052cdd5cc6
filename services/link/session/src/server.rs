//! Accepting-side runtime.
//!
//! Every accepted connection gets a reader task whose first frame must be a
//! connect request. The [`SessionRegistry`] maps session identities to the
//! owning session task; new sessions are inserted atomically and spawn their
//! own task, while reconnects are routed to the existing one.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use link_wire::{ConnectRequest, ConnectResponse, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::acceptor::AcceptedSession;
use crate::error::SessionError;
use crate::handshake::is_new_connect;
use crate::session::{
    Effect, IoEvent, SessionCommand, SessionConfig, SessionEvent, SessionHandle, SessionStats,
};
use crate::transport::{listen_tcp, FrameSink, TcpTransport, Transport, TransportId};

type Mailbox = mpsc::UnboundedSender<IoEvent>;

/// Live sessions of one server, keyed by session identity
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<u64, Mailbox>>,
}

impl SessionRegistry {
    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `session_id` is live
    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    fn get(&self, session_id: u64) -> Option<Mailbox> {
        self.sessions.get(&session_id).map(|entry| entry.value().clone())
    }

    /// Insert a mailbox for `session_id` unless one exists; returns the existing one otherwise
    fn insert_new(
        &self,
        session_id: u64,
    ) -> Result<(Mailbox, mpsc::UnboundedReceiver<IoEvent>), Mailbox> {
        match self.sessions.entry(session_id) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (mailbox, io_rx) = mpsc::unbounded_channel();
                entry.insert(mailbox.clone());
                Ok((mailbox, io_rx))
            }
        }
    }

    /// Remove `session_id` only if it still maps to `mailbox`
    fn remove_if_same(&self, session_id: u64, mailbox: &Mailbox) {
        self.sessions
            .remove_if(&session_id, |_, current| current.same_channel(mailbox));
    }
}

/// Removes a session's registry entry when its task ends, by return or by panic
struct RegistryGuard {
    registry: SessionRegistry,
    session_id: u64,
    mailbox: Mailbox,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove_if_same(self.session_id, &self.mailbox);
    }
}

struct ServerShared {
    config: SessionConfig,
    registry: SessionRegistry,
    incoming: mpsc::UnboundedSender<SessionHandle>,
}

/// Link server accepting sessions on one TCP listener
pub struct Server {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    incoming: mpsc::UnboundedReceiver<SessionHandle>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Listen on `addr`
    pub async fn bind(config: SessionConfig, addr: SocketAddr) -> Result<Self, SessionError> {
        config.validate()?;
        let listener = listen_tcp(addr).await?;
        let local_addr = listener.local_addr()?;

        let registry = SessionRegistry::default();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            config,
            registry: registry.clone(),
            incoming: incoming_tx,
        });
        let accept_task = tokio::spawn(accept_loop(listener, shared));

        info!("Link server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            registry,
            incoming,
            accept_task,
        })
    }

    /// Next newly created session; reconnects of existing sessions are handled internally
    pub async fn accept(&mut self) -> Option<SessionHandle> {
        self.incoming.recv().await
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Live session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                let sink = ServerSink {
                    shared: Arc::clone(&shared),
                    route: None,
                };
                if let Err(e) = TcpTransport::spawn(stream, &shared.config, sink) {
                    warn!("Failed to set up connection from {}: {}", peer, e);
                }
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Routes frames of one accepted connection to the session that owns it
struct ServerSink {
    shared: Arc<ServerShared>,
    route: Option<Mailbox>,
}

impl ServerSink {
    fn route_connect(&mut self, transport: &TcpTransport, request: ConnectRequest) -> bool {
        let registry = &self.shared.registry;
        let mailbox = match registry.get(request.session_id) {
            Some(mailbox) => mailbox,
            None if is_new_connect(&request) => match registry.insert_new(request.session_id) {
                Ok((mailbox, io_rx)) => {
                    let guard = RegistryGuard {
                        registry: registry.clone(),
                        session_id: request.session_id,
                        mailbox: mailbox.clone(),
                    };
                    let shared = Arc::clone(&self.shared);
                    spawn_session(shared, guard, request, transport.clone(), io_rx);
                    self.route = Some(mailbox);
                    return true;
                }
                Err(existing) => existing,
            },
            None => {
                if !request.is_close {
                    warn!(
                        "Rejecting handshake for unknown session {} from {}",
                        request.session_id,
                        transport.peer_addr()
                    );
                    let response = ConnectResponse::reject(&request);
                    transport.write_and_flush(Frame::ConnectResponse(response));
                }
                return true;
            }
        };

        let routed = mailbox.send(IoEvent::Connect {
            request,
            transport: transport.clone(),
        });
        if routed.is_err() {
            debug!("Session {} ended while routing a handshake", request.session_id);
            transport.write_and_flush(Frame::ConnectResponse(ConnectResponse::reject(&request)));
            self.route = None;
        } else {
            self.route = Some(mailbox);
        }
        true
    }
}

impl FrameSink for ServerSink {
    fn on_frame(&mut self, transport: &TcpTransport, frame: Frame) -> bool {
        match frame {
            Frame::ConnectRequest(request) => self.route_connect(transport, request),
            frame => match &self.route {
                Some(mailbox) => mailbox
                    .send(IoEvent::Frame {
                        transport: transport.id(),
                        frame,
                    })
                    .is_ok(),
                None => {
                    debug!(
                        "Dropping {:?} frame from {} before handshake",
                        frame.frame_type(),
                        transport.peer_addr()
                    );
                    false
                }
            },
        }
    }

    fn on_lost(&mut self, transport: TransportId) {
        if let Some(mailbox) = &self.route {
            let _ = mailbox.send(IoEvent::Lost { transport });
        }
    }
}

fn spawn_session(
    shared: Arc<ServerShared>,
    guard: RegistryGuard,
    request: ConnectRequest,
    transport: TcpTransport,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
) {
    tokio::spawn(async move {
        let _guard = guard;
        let session_id = request.session_id;
        let Some(mut actor) = AcceptorActor::start(&shared, &request, transport, io_rx) else {
            return;
        };
        actor.run().await;
        info!("Session {} ended. Stats: {:?}", session_id, actor.stats);
    });
}

struct AcceptorActor {
    session: AcceptedSession<TcpTransport>,
    tick_interval: Duration,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats: SessionStats,
}

impl AcceptorActor {
    /// Build the session from the connect request that created it and publish its handle
    fn start(
        shared: &ServerShared,
        request: &ConnectRequest,
        transport: TcpTransport,
        io_rx: mpsc::UnboundedReceiver<IoEvent>,
    ) -> Option<Self> {
        let session_id = request.session_id;
        let config = shared.config.clone();
        let tick_interval = config.tick_interval;
        let session = AcceptedSession::new(config, request, transport, Instant::now()).ok()?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(session_id, &shared.config, command_tx, event_rx);
        if shared.incoming.send(handle).is_err() {
            debug!("Server gone, session {} will close", session_id);
        }

        Some(Self {
            session,
            tick_interval,
            io_rx,
            commands,
            events,
            stats: SessionStats::default(),
        })
    }

    async fn run(&mut self) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut effects = Vec::new();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send(payload)) => {
                        self.stats.messages_sent += 1;
                        self.session.send(payload, Instant::now(), &mut effects);
                    }
                    Some(SessionCommand::Close) | None => self.session.close_local(&mut effects),
                },
                Some(event) = self.io_rx.recv() => self.on_io(event, &mut effects),
                _ = tick.tick() => self.session.tick(Instant::now(), &mut effects),
            }
            if self.apply(effects) {
                break;
            }
        }
    }

    fn on_io(&mut self, event: IoEvent, effects: &mut Vec<Effect>) {
        let now = Instant::now();
        match event {
            IoEvent::Frame { transport, frame } => {
                self.stats.frames_received += 1;
                self.session.on_frame(transport, frame, now, effects);
            }
            IoEvent::Lost { transport } => self.session.on_lost(transport),
            IoEvent::Connect { request, transport } => {
                self.stats.frames_received += 1;
                let rebinding = !request.is_close
                    && self.session.transport().map(Transport::id) != Some(transport.id());
                self.session.on_connect(&request, transport.clone(), now, effects);
                let bound = self.session.transport().map(Transport::id) == Some(transport.id());
                if rebinding && bound {
                    self.stats.rebinds += 1;
                }
            }
            IoEvent::Dialed { .. } => {}
        }
    }

    /// Apply effects in order; returns true once the session has closed
    fn apply(&mut self, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::Deliver(payload) => {
                    if !payload.is_heartbeat() {
                        self.stats.messages_delivered += 1;
                    }
                    let _ = self.events.send(SessionEvent::from(payload));
                }
                Effect::Closed(reason) => {
                    let _ = self.events.send(SessionEvent::Closed(reason));
                    return true;
                }
                Effect::Dial { .. } | Effect::Established => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_insert_is_exclusive() {
        let registry = SessionRegistry::default();
        let (mailbox, _rx) = registry.insert_new(5).unwrap();
        assert!(registry.contains(5));
        assert!(registry.insert_new(5).is_err());

        let (other, _other_rx) = mpsc::unbounded_channel();
        registry.remove_if_same(5, &other);
        assert_eq!(registry.len(), 1);

        registry.remove_if_same(5, &mailbox);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_guard_removes_entry_when_task_panics() {
        let registry = SessionRegistry::default();
        let (mailbox, _rx) = registry.insert_new(9).unwrap();
        let guard = RegistryGuard {
            registry: registry.clone(),
            session_id: 9,
            mailbox,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("session task failed");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(!registry.contains(9));
    }

    #[tokio::test]
    async fn test_guard_keeps_newer_entry() {
        let registry = SessionRegistry::default();
        let (stale, _stale_rx) = registry.insert_new(3).unwrap();
        let guard = RegistryGuard {
            registry: registry.clone(),
            session_id: 3,
            mailbox: stale.clone(),
        };
        registry.remove_if_same(3, &stale);
        let (_current, _current_rx) = registry.insert_new(3).unwrap();

        drop(guard);
        assert!(registry.contains(3));
    }
}
