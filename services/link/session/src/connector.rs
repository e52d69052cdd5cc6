//! Connecting-side state machine.
//!
//! ```text
//!            dial ok             response ok
//! Connecting -------> Verifying -------------> Verified
//!     ^                  |  ^                      |
//!     |  verify budget   |  |   ack deadline missed|
//!     +------------------+  +----------------------+
//!     ^                                            |
//!     +-------------- transport lost --------------+
//! ```
//!
//! The machine performs no I/O of its own beyond the bound transport's
//! fire-and-forget writes. Dialing and delivery are requested through
//! [`Effect`]s that the owning task applies. Every input carries the current
//! `Instant`, and deadlines are evaluated only in [`Connector::tick`].

use bytes::Bytes;
use link_wire::{ConnectRequest, ConnectResponse, Frame, Payload};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::handshake::origin_ack;
use crate::keepalive::Keepalive;
use crate::queue::MessageQueue;
use crate::session::{CloseReason, Effect, SessionConfig};
use crate::transfer;
use crate::transport::{Transport, TransportId};

/// Progress of the current dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    /// A dial is outstanding
    InFlight {
        /// Attempt number echoed by the dial result
        id: u64,
        /// When the dial started
        started: Instant,
    },
    /// Waiting before the next dial
    Idle {
        /// Earliest time to dial again
        not_before: Instant,
    },
}

/// Connector states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Opening a transport
    Connecting {
        /// Failed dials since entering this state
        attempts: u32,
        /// Current dial
        dial: Dial,
    },
    /// Waiting for the response to a handshake
    Verifying {
        /// Requests sent since entering this state
        attempts: u32,
        /// When the latest request was sent
        sent_at: Instant,
    },
    /// Exchanging messages
    Verified,
    /// Terminal
    Closed,
}

/// Connecting side of one session
#[derive(Debug)]
pub struct Connector<T: Transport> {
    session_id: u64,
    config: SessionConfig,
    queue: MessageQueue,
    state: ConnectorState,
    transport: Option<T>,
    verifying_times: u64,
    verified_times: u64,
    last_request: Option<ConnectRequest>,
    next_dial: u64,
    keepalive: Keepalive,
}

impl<T: Transport> Connector<T> {
    /// Create a connector with a random initial sequence; call [`Connector::start`] next
    pub fn new(session_id: u64, config: SessionConfig, now: Instant) -> Self {
        Self::with_queue(session_id, config, MessageQueue::with_random_init(), now)
    }

    /// Create a connector around an existing queue
    pub fn with_queue(
        session_id: u64,
        config: SessionConfig,
        queue: MessageQueue,
        now: Instant,
    ) -> Self {
        let keepalive = Keepalive::new(config.heartbeat_interval, config.idle_timeout, now);
        Self {
            session_id,
            config,
            queue,
            state: ConnectorState::Connecting {
                attempts: 0,
                dial: Dial::Idle { not_before: now },
            },
            transport: None,
            verifying_times: 0,
            verified_times: 0,
            last_request: None,
            next_dial: 0,
            keepalive,
        }
    }

    /// Session identity
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Current state
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Sequencing state
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Handshake requests sent over the session's lifetime
    pub fn verifying_times(&self) -> u64 {
        self.verifying_times
    }

    /// Handshakes that succeeded over the session's lifetime
    pub fn verified_times(&self) -> u64 {
        self.verified_times
    }

    /// Currently bound transport
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.state == ConnectorState::Closed
    }

    /// Issue the first dial
    pub fn start(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if let ConnectorState::Connecting { attempts, .. } = self.state {
            let dial = self.new_dial(now);
            self.transition(ConnectorState::Connecting { attempts, dial }, now, effects);
        }
    }

    /// Report the outcome of dial `attempt`; `None` means it failed
    pub fn on_dialed(
        &mut self,
        attempt: u64,
        transport: Option<T>,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let current = matches!(
            self.state,
            ConnectorState::Connecting { dial: Dial::InFlight { id, .. }, .. } if id == attempt
        );
        if !current {
            if let Some(transport) = transport {
                debug!("Discarding late transport {} from dial {}", transport.id(), attempt);
                transport.close();
            }
            return;
        }

        match transport {
            Some(transport) => {
                debug!(
                    "Session {} dial {} connected as transport {}",
                    self.session_id,
                    attempt,
                    transport.id()
                );
                self.transport = Some(transport);
                self.transition(
                    ConnectorState::Verifying {
                        attempts: 0,
                        sent_at: now,
                    },
                    now,
                    effects,
                );
            }
            None => self.dial_failed(now, effects),
        }
    }

    /// Handle a frame read from `transport`
    pub fn on_frame(
        &mut self,
        transport: TransportId,
        frame: Frame,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.transport.as_ref().map(Transport::id) != Some(transport) {
            return;
        }
        self.keepalive.touch(now);

        match (self.state, frame) {
            (_, Frame::ConnectResponse(response)) if response.is_close => {
                info!("Session {} closed by peer", self.session_id);
                self.close(CloseReason::Remote, false, effects);
            }
            (ConnectorState::Verifying { .. }, Frame::ConnectResponse(response)) => {
                self.on_response(response, now, effects);
            }
            (ConnectorState::Verified, Frame::Single(message)) => {
                let transport = self.transport.as_ref();
                let delivered =
                    transfer::read_message(&mut self.queue, transport, &self.config, message, now);
                effects.extend(delivered.map(Effect::Deliver));
            }
            (ConnectorState::Verified, Frame::Batch(batch)) => {
                let transport = self.transport.as_ref();
                let delivered =
                    transfer::read_batch(&mut self.queue, transport, &self.config, batch, now);
                effects.extend(delivered.into_iter().map(Effect::Deliver));
            }
            (ConnectorState::Verified, Frame::Heartbeat { ack }) => {
                let transport = self.transport.as_ref();
                transfer::read_ack(&mut self.queue, transport, &self.config, ack, now);
            }
            (state, frame) => {
                debug!(
                    "Session {} ignoring {:?} frame in {:?}",
                    self.session_id,
                    frame.frame_type(),
                    state
                );
            }
        }
    }

    /// The connection behind `transport` is gone
    pub fn on_lost(&mut self, transport: TransportId, now: Instant, effects: &mut Vec<Effect>) {
        if self.transport.as_ref().map(Transport::id) != Some(transport) {
            return;
        }
        if matches!(
            self.state,
            ConnectorState::Verifying { .. } | ConnectorState::Verified
        ) {
            info!(
                "Session {} lost transport {}, reconnecting",
                self.session_id, transport
            );
            let dial = self.new_dial(now);
            self.transition(ConnectorState::Connecting { attempts: 0, dial }, now, effects);
        }
    }

    /// Queue an application message
    pub fn send(&mut self, payload: Bytes, now: Instant, effects: &mut Vec<Effect>) {
        self.write(Payload::Data(payload), now, effects);
    }

    /// Close at the application's request, notifying the peer
    pub fn close_local(&mut self, effects: &mut Vec<Effect>) {
        self.close(CloseReason::Local, true, effects);
    }

    /// Evaluate deadlines and push out queued traffic
    pub fn tick(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        match self.state {
            ConnectorState::Connecting {
                attempts,
                dial: Dial::InFlight { id, started },
            } => {
                if now.saturating_duration_since(started) >= self.config.connect_timeout {
                    warn!(
                        "Session {} dial {} timed out after {:?}",
                        self.session_id, id, self.config.connect_timeout
                    );
                    self.state = ConnectorState::Connecting {
                        attempts,
                        dial: Dial::Idle { not_before: now },
                    };
                    self.dial_failed(now, effects);
                }
            }
            ConnectorState::Connecting {
                attempts,
                dial: Dial::Idle { not_before },
            } => {
                if now >= not_before {
                    let dial = self.new_dial(now);
                    self.transition(ConnectorState::Connecting { attempts, dial }, now, effects);
                }
            }
            ConnectorState::Verifying { attempts, sent_at } => {
                if now.saturating_duration_since(sent_at) < self.config.verify_timeout {
                    return;
                }
                if attempts >= self.config.max_verify_times {
                    warn!(
                        "Session {} got no handshake response after {} attempts, redialing",
                        self.session_id, attempts
                    );
                    let dial = self.new_dial(now);
                    self.transition(ConnectorState::Connecting { attempts: 0, dial }, now, effects);
                } else {
                    self.send_request(now);
                    self.state = ConnectorState::Verifying {
                        attempts: attempts + 1,
                        sent_at: now,
                    };
                }
            }
            ConnectorState::Verified => {
                if transfer::check_ack_timeout(&mut self.queue, now) {
                    warn!(
                        "Session {} ack deadline missed, re-verifying",
                        self.session_id
                    );
                    self.transition(
                        ConnectorState::Verifying {
                            attempts: 0,
                            sent_at: now,
                        },
                        now,
                        effects,
                    );
                    return;
                }
                if self.keepalive.heartbeat_due(now) {
                    self.write(Payload::Heartbeat, now, effects);
                    if self.is_closed() {
                        return;
                    }
                }
                let transport = self.transport.as_ref();
                transfer::emit(&mut self.queue, transport, &self.config, now);
                transfer::report_ack(&mut self.queue, transport);
                transfer::flush(&self.queue, transport);
            }
            ConnectorState::Closed => {}
        }
    }

    /// Enter `next`, running its entry actions
    fn transition(&mut self, next: ConnectorState, now: Instant, effects: &mut Vec<Effect>) {
        debug!(
            "Session {} transition {:?} -> {:?}",
            self.session_id, self.state, next
        );
        self.state = next;

        match next {
            ConnectorState::Connecting { dial, .. } => {
                if let Some(transport) = self.transport.take() {
                    transport.close();
                }
                self.last_request = None;
                if let Dial::InFlight { id, .. } = dial {
                    effects.push(Effect::Dial { attempt: id });
                }
            }
            ConnectorState::Verifying { .. } => {
                self.send_request(now);
                self.state = ConnectorState::Verifying {
                    attempts: 1,
                    sent_at: now,
                };
            }
            ConnectorState::Verified => {
                let Some(transport) = self.transport.as_ref() else {
                    return;
                };
                if self.verified_times == 1 {
                    info!("Session {} established", self.session_id);
                    effects.push(Effect::Established);
                } else {
                    info!(
                        "Session {} reconnected ({} verifications)",
                        self.session_id, self.verified_times
                    );
                    effects.push(Effect::Deliver(Payload::Heartbeat));
                    transfer::resend(&mut self.queue, transport, &self.config, now);
                }
                transfer::emit(&mut self.queue, Some(transport), &self.config, now);
                transfer::flush(&self.queue, Some(transport));
            }
            ConnectorState::Closed => {}
        }
    }

    fn on_response(&mut self, response: ConnectResponse, now: Instant, effects: &mut Vec<Effect>) {
        let Some(request) = self.last_request else {
            return;
        };
        if !response.answers(&request) {
            debug!(
                "Session {} ignoring stale response ({}, {}), expecting ({}, {})",
                self.session_id,
                response.verifying_times,
                response.verified_times,
                request.verifying_times,
                request.verified_times
            );
            return;
        }
        if !response.success {
            warn!("Session {} handshake rejected by peer", self.session_id);
            self.close(CloseReason::Rejected, false, effects);
            return;
        }

        if !self.queue.is_ack_ok(response.ack) {
            warn!(
                "Session {} peer ack {} cannot be reconciled (next sequence {})",
                self.session_id,
                response.ack,
                self.queue.peek_next_sequence()
            );
            self.close(CloseReason::AckMismatch, true, effects);
            return;
        }
        if self.verified_times == 0 {
            let Ok(ack) = origin_ack(response.init_sequence) else {
                warn!(
                    "Session {} peer initial sequence {} overflows",
                    self.session_id, response.init_sequence
                );
                self.close(CloseReason::AckMismatch, true, effects);
                return;
            };
            self.queue.set_ack(ack);
            self.queue.mark_ack_reported();
        } else {
            self.queue.update_pending_queue(response.ack);
        }

        self.verified_times += 1;
        self.transition(ConnectorState::Verified, now, effects);
    }

    fn send_request(&mut self, now: Instant) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        self.verifying_times += 1;
        let request = ConnectRequest {
            session_id: self.session_id,
            verifying_times: self.verifying_times,
            verified_times: self.verified_times,
            init_sequence: self.queue.init_sequence(),
            ack: self.queue.ack(),
            is_close: false,
        };
        debug!(
            "Session {} sending handshake ({}, {}) on transport {}",
            self.session_id,
            request.verifying_times,
            request.verified_times,
            transport.id()
        );
        transport.write_and_flush(Frame::ConnectRequest(request));
        self.last_request = Some(request);
        self.keepalive.touch(now);
    }

    fn write(&mut self, payload: Payload, now: Instant, effects: &mut Vec<Effect>) {
        if self.is_closed() {
            return;
        }
        let transport = match self.state {
            ConnectorState::Verified => self.transport.as_ref(),
            _ => None,
        };
        if let Err(e) = transfer::write(&mut self.queue, transport, &self.config, payload, now) {
            warn!("Session {}: {}", self.session_id, e);
            self.close(CloseReason::CacheOverflow, true, effects);
        }
    }

    fn new_dial(&mut self, now: Instant) -> Dial {
        self.next_dial += 1;
        Dial::InFlight {
            id: self.next_dial,
            started: now,
        }
    }

    fn dial_failed(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let ConnectorState::Connecting { attempts, .. } = self.state else {
            return;
        };
        let attempts = attempts + 1;
        if attempts >= self.config.max_connect_times {
            warn!(
                "Session {} giving up after {} failed dials",
                self.session_id, attempts
            );
            self.close(CloseReason::ConnectExhausted, false, effects);
            return;
        }
        debug!(
            "Session {} dial failed ({} of {}), retrying in {:?}",
            self.session_id,
            attempts,
            self.config.max_connect_times,
            self.config.connect_retry_interval
        );
        self.transition(
            ConnectorState::Connecting {
                attempts,
                dial: Dial::Idle {
                    not_before: now + self.config.connect_retry_interval,
                },
            },
            now,
            effects,
        );
    }

    fn close(&mut self, reason: CloseReason, notify: bool, effects: &mut Vec<Effect>) {
        if self.is_closed() {
            return;
        }
        if let Some(transport) = self.transport.take() {
            if notify {
                transport.write_and_flush(Frame::ConnectRequest(ConnectRequest::close(
                    self.session_id,
                    self.queue.ack(),
                )));
            }
            transport.close();
        }
        self.queue.clean_message_queue();
        self.state = ConnectorState::Closed;
        info!("Session {} closed: {}", self.session_id, reason);
        effects.push(Effect::Closed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use link_wire::SingleMessage;
    use std::time::Duration;

    const SESSION: u64 = 42;

    fn connector(now: Instant) -> Connector<MemoryTransport> {
        Connector::with_queue(SESSION, SessionConfig::default(), MessageQueue::new(100), now)
    }

    fn last_request(transport: &MemoryTransport) -> ConnectRequest {
        transport
            .drain()
            .into_iter()
            .rev()
            .find_map(|frame| match frame {
                Frame::ConnectRequest(request) => Some(request),
                _ => None,
            })
            .expect("no connect request written")
    }

    fn success(request: &ConnectRequest, init: u64, ack: u64) -> Frame {
        Frame::ConnectResponse(ConnectResponse {
            session_id: request.session_id,
            success: true,
            verifying_times: request.verifying_times,
            verified_times: request.verified_times,
            init_sequence: init,
            ack,
            is_close: false,
        })
    }

    /// Drive a fresh connector to Verified; returns the transport
    fn establish(connector: &mut Connector<MemoryTransport>, now: Instant) -> MemoryTransport {
        let mut effects = Vec::new();
        connector.start(now, &mut effects);
        assert_eq!(effects, vec![Effect::Dial { attempt: 1 }]);

        let transport = MemoryTransport::new();
        effects.clear();
        connector.on_dialed(1, Some(transport.clone()), now, &mut effects);
        let request = last_request(&transport);
        assert_eq!(request.verifying_times, 1);
        assert_eq!(request.verified_times, 0);
        assert_eq!(request.ack, 0);

        connector.on_frame(transport.id(), success(&request, 500, 101), now, &mut effects);
        assert_eq!(effects, vec![Effect::Established]);
        transport
    }

    #[test]
    fn test_first_verification() {
        let now = Instant::now();
        let mut connector = connector(now);
        establish(&mut connector, now);

        assert_eq!(connector.state(), ConnectorState::Verified);
        assert_eq!(connector.verified_times(), 1);
        assert_eq!(connector.queue().ack(), 501);
    }

    #[test]
    fn test_stale_response_ignored() {
        let now = Instant::now();
        let mut connector = connector(now);
        let mut effects = Vec::new();
        connector.start(now, &mut effects);
        let transport = MemoryTransport::new();
        connector.on_dialed(1, Some(transport.clone()), now, &mut effects);
        let request = last_request(&transport);

        let stale = ConnectRequest {
            verifying_times: request.verifying_times + 5,
            ..request
        };
        effects.clear();
        connector.on_frame(transport.id(), success(&stale, 500, 101), now, &mut effects);
        assert!(effects.is_empty());
        assert!(matches!(connector.state(), ConnectorState::Verifying { .. }));
    }

    #[test]
    fn test_rejection_closes_session() {
        let now = Instant::now();
        let mut connector = connector(now);
        let mut effects = Vec::new();
        connector.start(now, &mut effects);
        let transport = MemoryTransport::new();
        connector.on_dialed(1, Some(transport.clone()), now, &mut effects);
        let request = last_request(&transport);

        effects.clear();
        connector.on_frame(
            transport.id(),
            Frame::ConnectResponse(ConnectResponse::reject(&request)),
            now,
            &mut effects,
        );
        assert_eq!(effects, vec![Effect::Closed(CloseReason::Rejected)]);
        assert!(connector.is_closed());
        assert!(transport.is_closed());
        // No close notification after a rejection
        assert!(transport.drain().is_empty());
    }

    #[test]
    fn test_connect_budget_exhausted() {
        let start = Instant::now();
        let config = SessionConfig {
            max_connect_times: 2,
            ..SessionConfig::default()
        };
        let mut connector: Connector<MemoryTransport> =
            Connector::with_queue(SESSION, config.clone(), MessageQueue::new(0), start);
        let mut effects = Vec::new();
        connector.start(start, &mut effects);

        connector.on_dialed(1, None, start, &mut effects);
        assert!(matches!(
            connector.state(),
            ConnectorState::Connecting { attempts: 1, dial: Dial::Idle { .. } }
        ));

        effects.clear();
        let retry = start + config.connect_retry_interval;
        connector.tick(retry, &mut effects);
        assert_eq!(effects, vec![Effect::Dial { attempt: 2 }]);

        effects.clear();
        connector.tick(retry + config.connect_timeout, &mut effects);
        assert_eq!(effects, vec![Effect::Closed(CloseReason::ConnectExhausted)]);
    }

    #[test]
    fn test_late_dial_result_discarded() {
        let start = Instant::now();
        let mut connector = connector(start);
        let mut effects = Vec::new();
        connector.start(start, &mut effects);
        connector.tick(start + SessionConfig::default().connect_timeout, &mut effects);

        let late = MemoryTransport::new();
        connector.on_dialed(1, Some(late.clone()), start, &mut effects);
        assert!(late.is_closed());
        assert!(connector.transport().is_none());
    }

    #[test]
    fn test_verify_retry_then_redial() {
        let start = Instant::now();
        let config = SessionConfig {
            max_verify_times: 2,
            ..SessionConfig::default()
        };
        let mut connector: Connector<MemoryTransport> =
            Connector::with_queue(SESSION, config.clone(), MessageQueue::new(0), start);
        let mut effects = Vec::new();
        connector.start(start, &mut effects);
        let transport = MemoryTransport::new();
        connector.on_dialed(1, Some(transport.clone()), start, &mut effects);
        assert_eq!(last_request(&transport).verifying_times, 1);

        let first_timeout = start + config.verify_timeout;
        connector.tick(first_timeout, &mut effects);
        assert_eq!(last_request(&transport).verifying_times, 2);

        effects.clear();
        connector.tick(first_timeout + config.verify_timeout, &mut effects);
        assert_eq!(effects, vec![Effect::Dial { attempt: 2 }]);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_writes_cached_until_verified() {
        let now = Instant::now();
        let mut connector = connector(now);
        let mut effects = Vec::new();
        connector.send(Bytes::from_static(b"early"), now, &mut effects);
        assert_eq!(connector.queue().cache().len(), 1);

        let transport = establish(&mut connector, now);
        assert!(connector.queue().cache().is_empty());
        assert_eq!(connector.queue().pending().len(), 1);
        assert!(matches!(
            transport.drain().as_slice(),
            [Frame::Single(SingleMessage { sequence: 101, .. })]
        ));
    }

    #[test]
    fn test_inbound_messages_delivered_in_order() {
        let now = Instant::now();
        let mut connector = connector(now);
        let transport = establish(&mut connector, now);

        let mut effects = Vec::new();
        for (sequence, text) in [(501, "a"), (501, "dup"), (502, "b")] {
            connector.on_frame(
                transport.id(),
                Frame::Single(SingleMessage {
                    ack: 101,
                    sequence,
                    payload: Payload::Data(Bytes::from_static(text.as_bytes())),
                }),
                now,
                &mut effects,
            );
        }
        assert_eq!(
            effects,
            vec![
                Effect::Deliver(Payload::Data(Bytes::from_static(b"a"))),
                Effect::Deliver(Payload::Data(Bytes::from_static(b"b"))),
            ]
        );
        assert_eq!(connector.queue().ack(), 503);
    }

    #[test]
    fn test_ack_timeout_triggers_reverification() {
        let start = Instant::now();
        let mut connector = connector(start);
        let transport = establish(&mut connector, start);
        let mut effects = Vec::new();
        connector.send(Bytes::from_static(b"x"), start, &mut effects);
        transport.drain();

        connector.tick(start + SessionConfig::default().ack_timeout, &mut effects);
        assert!(matches!(connector.state(), ConnectorState::Verifying { .. }));
        let request = last_request(&transport);
        assert_eq!(request.verifying_times, 2);
        assert_eq!(request.verified_times, 1);
        assert_eq!(request.ack, 501);
    }

    #[test]
    fn test_lost_transport_redials_and_keeps_queue() {
        let now = Instant::now();
        let mut connector = connector(now);
        let transport = establish(&mut connector, now);
        let mut effects = Vec::new();
        connector.send(Bytes::from_static(b"x"), now, &mut effects);

        connector.on_lost(transport.id(), now, &mut effects);
        assert_eq!(effects, vec![Effect::Dial { attempt: 2 }]);
        assert_eq!(connector.queue().pending().len(), 1);
        assert!(connector.transport().is_none());
    }

    #[test]
    fn test_unreconcilable_ack_closes_session() {
        let now = Instant::now();
        let mut connector = connector(now);
        let first = establish(&mut connector, now);
        let mut effects = Vec::new();
        connector.send(Bytes::from_static(b"x"), now, &mut effects);
        connector.on_lost(first.id(), now, &mut effects);

        let second = MemoryTransport::new();
        connector.on_dialed(2, Some(second.clone()), now, &mut effects);
        let request = last_request(&second);
        assert_eq!(request.verified_times, 1);

        effects.clear();
        // Acknowledges a message that was never sent
        connector.on_frame(second.id(), success(&request, 500, 150), now, &mut effects);
        assert_eq!(effects, vec![Effect::Closed(CloseReason::AckMismatch)]);
        assert!(connector.queue().pending().is_empty());
        assert!(matches!(
            second.drain().as_slice(),
            [Frame::ConnectRequest(ConnectRequest { is_close: true, .. })]
        ));
    }

    #[test]
    fn test_overflowing_peer_origin_closes_session() {
        let now = Instant::now();
        let mut connector = connector(now);
        let mut effects = Vec::new();
        connector.start(now, &mut effects);
        let transport = MemoryTransport::new();
        connector.on_dialed(1, Some(transport.clone()), now, &mut effects);
        let request = last_request(&transport);

        effects.clear();
        connector.on_frame(transport.id(), success(&request, u64::MAX, 101), now, &mut effects);
        assert_eq!(effects, vec![Effect::Closed(CloseReason::AckMismatch)]);
        assert!(connector.is_closed());
        assert_eq!(connector.verified_times(), 0);
        assert!(matches!(
            transport.drain().as_slice(),
            [Frame::ConnectRequest(ConnectRequest { is_close: true, .. })]
        ));
    }

    #[test]
    fn test_remote_close() {
        let now = Instant::now();
        let mut connector = connector(now);
        let transport = establish(&mut connector, now);
        let mut effects = Vec::new();

        connector.on_frame(
            transport.id(),
            Frame::ConnectResponse(ConnectResponse::close(SESSION, 0)),
            now,
            &mut effects,
        );
        assert_eq!(effects, vec![Effect::Closed(CloseReason::Remote)]);
        assert!(transport.drain().is_empty());
    }

    #[test]
    fn test_local_close_notifies_peer() {
        let now = Instant::now();
        let mut connector = connector(now);
        let transport = establish(&mut connector, now);
        transport.drain();
        let mut effects = Vec::new();

        connector.close_local(&mut effects);
        assert_eq!(effects, vec![Effect::Closed(CloseReason::Local)]);
        assert!(matches!(
            transport.drain().as_slice(),
            [Frame::ConnectRequest(ConnectRequest { is_close: true, .. })]
        ));

        // Writes after close are discarded
        connector.send(Bytes::from_static(b"late"), now, &mut effects);
        assert!(connector.queue().cache().is_empty());
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn test_heartbeat_on_tick() {
        let start = Instant::now();
        let mut connector = connector(start);
        let transport = establish(&mut connector, start);
        transport.drain();
        let mut effects = Vec::new();

        connector.tick(start + Duration::from_secs(10), &mut effects);
        assert!(matches!(
            transport.drain().as_slice(),
            [Frame::Single(SingleMessage { payload: Payload::Heartbeat, .. })]
        ));
    }
}
