//! Session configuration, events and the application-facing handle.
//!
//! A session is owned by one tokio task (see `client` and `server`). The
//! application talks to it only through a [`SessionHandle`], which sends
//! commands into the task's mailbox and receives [`SessionEvent`]s back.

use bytes::Bytes;
use link_wire::{ConnectRequest, Frame, Payload, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::transport::{TcpTransport, TransportId};

/// Frame bytes reserved for header and batch bookkeeping when sizing payloads
const FRAME_OVERHEAD: usize = 64;

/// Configuration for a link session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Send window: messages in flight awaiting ack
    pub max_pending_messages: usize,
    /// Messages held back while the window is full or the transport is down
    pub max_cache_messages: usize,
    /// Time the peer has to acknowledge a sent message
    pub ack_timeout: Duration,
    /// Time allowed for one dial attempt
    pub connect_timeout: Duration,
    /// Dial attempts per reconnection before the session is closed
    pub max_connect_times: u32,
    /// Pause between failed dial attempts
    pub connect_retry_interval: Duration,
    /// Time allowed for one handshake attempt
    pub verify_timeout: Duration,
    /// Handshake attempts per transport before redialing
    pub max_verify_times: u32,
    /// Interval between heartbeat payloads
    pub heartbeat_interval: Duration,
    /// Accepting side closes the session after this long without inbound frames
    pub idle_timeout: Duration,
    /// Period of the session tick that evaluates deadlines
    pub tick_interval: Duration,
    /// Queued transport bytes above which the transport reports not writable
    pub write_high_water_mark: usize,
    /// Largest encoded frame accepted or produced
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 256,
            max_cache_messages: 65536,
            ack_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_connect_times: 5,
            connect_retry_interval: Duration::from_secs(1),
            verify_timeout: Duration::from_secs(5),
            max_verify_times: 3,
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_millis(100),
            write_high_water_mark: 4 * 1024 * 1024, // 4 MiB
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    /// Reject settings the protocol cannot work with
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_pending_messages == 0 {
            return Err(SessionError::Config("max_pending_messages must be positive".into()));
        }
        if self.max_cache_messages == 0 {
            return Err(SessionError::Config("max_cache_messages must be positive".into()));
        }
        if self.max_connect_times == 0 || self.max_verify_times == 0 {
            return Err(SessionError::Config(
                "max_connect_times and max_verify_times must be positive".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(SessionError::Config("tick_interval must be positive".into()));
        }
        if self.ack_timeout <= self.heartbeat_interval {
            return Err(SessionError::Config(format!(
                "ack_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.ack_timeout, self.heartbeat_interval
            )));
        }
        if self.max_frame_size <= FRAME_OVERHEAD || self.max_frame_size > HARD_MAX_FRAME_SIZE {
            return Err(SessionError::Config(format!(
                "max_frame_size must be in ({}, {}]",
                FRAME_OVERHEAD, HARD_MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    /// Largest application payload that fits in a single frame
    pub fn max_payload_size(&self) -> usize {
        self.max_frame_size - FRAME_OVERHEAD
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local application
    Local,
    /// Closed by the peer
    Remote,
    /// Too many messages waited for the window
    CacheOverflow,
    /// Dial attempts exhausted
    ConnectExhausted,
    /// Peer refused the handshake
    Rejected,
    /// Peer's ack could not be reconciled with the pending window
    AckMismatch,
    /// No inbound traffic within the idle timeout
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Local => "closed locally",
            CloseReason::Remote => "closed by peer",
            CloseReason::CacheOverflow => "send cache overflow",
            CloseReason::ConnectExhausted => "connect attempts exhausted",
            CloseReason::Rejected => "handshake rejected",
            CloseReason::AckMismatch => "ack mismatch",
            CloseReason::IdleTimeout => "idle timeout",
        };
        f.write_str(text)
    }
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// In-order application message
    Message(Bytes),
    /// Peer heartbeat, or a synthesized one after the transport was replaced
    Heartbeat,
    /// Session ended; no further events follow
    Closed(CloseReason),
}

/// Output of the protocol state machines, applied by the owning task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport; the result must be reported with this attempt number
    Dial {
        /// Attempt number to echo back
        attempt: u64,
    },
    /// Hand a payload to the next stage
    Deliver(Payload),
    /// First handshake succeeded, the session is usable
    Established,
    /// Session closed
    Closed(CloseReason),
}

/// Counters kept by a session task, logged when it ends
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Frames read from any bound transport
    pub frames_received: u64,
    /// Application messages delivered
    pub messages_delivered: u64,
    /// Application messages accepted for sending
    pub messages_sent: u64,
    /// Transports bound after the first one
    pub rebinds: u64,
}

impl From<Payload> for SessionEvent {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Heartbeat => SessionEvent::Heartbeat,
            Payload::Data(data) => SessionEvent::Message(data),
        }
    }
}

/// Commands from the application into a session task
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send(Bytes),
    Close,
}

/// Transport-side input to a session task
#[derive(Debug)]
pub(crate) enum IoEvent {
    /// Frame read from a transport
    Frame { transport: TransportId, frame: Frame },
    /// Transport hit EOF or an error
    Lost { transport: TransportId },
    /// Handshake request routed to an existing session, with the transport it arrived on
    Connect {
        request: ConnectRequest,
        transport: TcpTransport,
    },
    /// Outcome of a dial started by `Effect::Dial`
    Dialed {
        attempt: u64,
        result: std::io::Result<TcpStream>,
    },
}

/// Cloneable sending half of a session handle
#[derive(Clone, Debug)]
pub struct SessionSender {
    session_id: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    max_payload: usize,
}

impl SessionSender {
    /// Queue a message for in-order delivery to the peer
    pub fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        if payload.len() > self.max_payload {
            return Err(SessionError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }
        self.commands
            .send(SessionCommand::Send(payload))
            .map_err(|_| SessionError::Closed)
    }

    /// Close the session and notify the peer
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    /// Session identity
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Whether the session task has ended
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Application handle to a running session
#[derive(Debug)]
pub struct SessionHandle {
    sender: SessionSender,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: u64,
        config: &SessionConfig,
        commands: mpsc::UnboundedSender<SessionCommand>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            sender: SessionSender {
                session_id,
                commands,
                max_payload: config.max_payload_size(),
            },
            events,
        }
    }

    /// Queue a message for in-order delivery to the peer
    pub fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        self.sender.send(payload)
    }

    /// Next event; `None` once the session task is gone and all events are drained
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Close the session and notify the peer
    pub fn close(&self) {
        self.sender.close();
    }

    /// Session identity
    pub fn session_id(&self) -> u64 {
        self.sender.session_id
    }

    /// Separate the sending half from the event stream
    pub fn split(self) -> (SessionSender, mpsc::UnboundedReceiver<SessionEvent>) {
        (self.sender, self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_pending_messages, 256);
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_rejects_ack_timeout_below_heartbeat() {
        let config = SessionConfig {
            ack_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_config_rejects_empty_window() {
        let config = SessionConfig {
            max_pending_messages: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payload_to_event() {
        assert_eq!(SessionEvent::from(Payload::Heartbeat), SessionEvent::Heartbeat);
        assert_eq!(
            SessionEvent::from(Payload::Data(Bytes::from_static(b"hi"))),
            SessionEvent::Message(Bytes::from_static(b"hi"))
        );
    }

    #[tokio::test]
    async fn test_handle_rejects_oversized_payload() {
        let config = SessionConfig {
            max_frame_size: 128,
            ..SessionConfig::default()
        };
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (_events_tx, events) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(9, &config, commands, events);

        let err = handle.send(Bytes::from(vec![0u8; 100])).unwrap_err();
        assert!(matches!(err, SessionError::PayloadTooLarge { size: 100, .. }));

        handle.send(Bytes::from_static(b"ok")).unwrap();
        assert!(matches!(rx.recv().await, Some(SessionCommand::Send(_))));
    }
}
