//! Accepting-side session logic.
//!
//! There is no explicit state: an [`AcceptedSession`] is either bound to a
//! transport, waiting for the connector to come back, or closed. Connect
//! requests are validated against the counters recorded at the last
//! successful handshake before the session is rebound.

use bytes::Bytes;
use link_wire::{ConnectRequest, ConnectResponse, Frame, Payload};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::handshake::{accept_response, origin_ack, validate_reconnect, Rejection};
use crate::keepalive::Keepalive;
use crate::queue::MessageQueue;
use crate::session::{CloseReason, Effect, SessionConfig};
use crate::transfer;
use crate::transport::{Transport, TransportId};

/// Accepting side of one session
#[derive(Debug)]
pub struct AcceptedSession<T: Transport> {
    session_id: u64,
    config: SessionConfig,
    queue: MessageQueue,
    transport: Option<T>,
    verifying_times: u64,
    verified_times: u64,
    keepalive: Keepalive,
    closed: bool,
}

impl<T: Transport> AcceptedSession<T> {
    /// Create a session for a new connect request and answer it on `transport`.
    ///
    /// A request that cannot start a session is answered with a failure
    /// response and no session is created.
    pub fn new(
        config: SessionConfig,
        request: &ConnectRequest,
        transport: T,
        now: Instant,
    ) -> Result<Self, Rejection> {
        Self::with_queue(config, MessageQueue::with_random_init(), request, transport, now)
    }

    /// Create a session around an existing queue
    pub fn with_queue(
        config: SessionConfig,
        mut queue: MessageQueue,
        request: &ConnectRequest,
        transport: T,
        now: Instant,
    ) -> Result<Self, Rejection> {
        let ack = match origin_ack(request.init_sequence) {
            Ok(ack) => ack,
            Err(rejection) => {
                warn!(
                    "Session {} rejecting connect on transport {}: {}",
                    request.session_id,
                    transport.id(),
                    rejection
                );
                transport.write_and_flush(Frame::ConnectResponse(ConnectResponse::reject(request)));
                return Err(rejection);
            }
        };
        queue.set_ack(ack);
        let keepalive = Keepalive::new(config.heartbeat_interval, config.idle_timeout, now);
        let mut session = Self {
            session_id: request.session_id,
            config,
            queue,
            transport: None,
            verifying_times: request.verifying_times,
            verified_times: request.verified_times,
            keepalive,
            closed: false,
        };
        info!(
            "Session {} created on transport {} (peer init {})",
            session.session_id,
            transport.id(),
            request.init_sequence
        );
        session.reply(&transport, accept_response(request, &session.queue));
        session.transport = Some(transport);
        Ok(session)
    }

    /// Session identity
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Sequencing state
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Currently bound transport
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// `verifying_times` of the last accepted request
    pub fn verifying_times(&self) -> u64 {
        self.verifying_times
    }

    /// `verified_times` of the last accepted request
    pub fn verified_times(&self) -> u64 {
        self.verified_times
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle a connect, reconnect or close request that arrived on `transport`
    pub fn on_connect(
        &mut self,
        request: &ConnectRequest,
        transport: T,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if request.is_close {
            let bound = self.transport.as_ref().map(Transport::id);
            if !self.closed && bound == Some(transport.id()) {
                info!("Session {} closed by peer", self.session_id);
                self.close(CloseReason::Remote, false, effects);
            } else {
                debug!(
                    "Session {} ignoring close request on unbound transport {}",
                    self.session_id,
                    transport.id()
                );
            }
            return;
        }

        let verdict = if self.closed {
            Err(Rejection::Closed)
        } else {
            validate_reconnect(request, self.verifying_times, self.verified_times, &self.queue)
        };
        if let Err(rejection) = verdict {
            warn!(
                "Session {} rejecting handshake on transport {}: {}",
                self.session_id,
                transport.id(),
                rejection
            );
            self.reply(&transport, ConnectResponse::reject(request));
            return;
        }

        self.keepalive.touch(now);
        match self.transport.take() {
            Some(old) if old.id() != transport.id() => {
                debug!(
                    "Session {} replacing transport {} with {}",
                    self.session_id,
                    old.id(),
                    transport.id()
                );
                old.close();
            }
            _ => {}
        }

        if request.verified_times > 0 {
            self.queue.update_pending_queue(request.ack);
        }
        self.verifying_times = request.verifying_times;
        self.verified_times = request.verified_times;

        info!(
            "Session {} verified on transport {} ({}, {})",
            self.session_id,
            transport.id(),
            request.verifying_times,
            request.verified_times
        );
        self.reply(&transport, accept_response(request, &self.queue));
        effects.push(Effect::Deliver(Payload::Heartbeat));

        transfer::resend(&mut self.queue, &transport, &self.config, now);
        transfer::emit(&mut self.queue, Some(&transport), &self.config, now);
        transfer::flush(&self.queue, Some(&transport));
        self.transport = Some(transport);
    }

    /// Handle a data or ack frame read from `transport`
    pub fn on_frame(
        &mut self,
        transport: TransportId,
        frame: Frame,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.closed || self.transport.as_ref().map(Transport::id) != Some(transport) {
            return;
        }
        self.keepalive.touch(now);

        match frame {
            Frame::Single(message) => {
                let transport = self.transport.as_ref();
                let delivered =
                    transfer::read_message(&mut self.queue, transport, &self.config, message, now);
                effects.extend(delivered.map(Effect::Deliver));
            }
            Frame::Batch(batch) => {
                let transport = self.transport.as_ref();
                let delivered =
                    transfer::read_batch(&mut self.queue, transport, &self.config, batch, now);
                effects.extend(delivered.into_iter().map(Effect::Deliver));
            }
            Frame::Heartbeat { ack } => {
                let transport = self.transport.as_ref();
                transfer::read_ack(&mut self.queue, transport, &self.config, ack, now);
            }
            frame => {
                debug!(
                    "Session {} ignoring {:?} frame",
                    self.session_id,
                    frame.frame_type()
                );
            }
        }
    }

    /// The connection behind `transport` is gone; wait for a reconnect
    pub fn on_lost(&mut self, transport: TransportId) {
        if self.transport.as_ref().map(Transport::id) == Some(transport) {
            info!(
                "Session {} lost transport {}, waiting for reconnect",
                self.session_id, transport
            );
            if let Some(transport) = self.transport.take() {
                transport.close();
            }
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
        if self.closed {
            return;
        }
        if self.keepalive.is_idle(now) {
            warn!(
                "Session {} idle for {:?}, closing",
                self.session_id,
                self.keepalive.idle_for(now)
            );
            self.close(CloseReason::IdleTimeout, true, effects);
            return;
        }
        if self.transport.is_none() {
            return;
        }

        if transfer::check_ack_timeout(&mut self.queue, now) {
            warn!(
                "Session {} ack deadline missed, waiting for the peer to re-verify",
                self.session_id
            );
        }
        if self.keepalive.heartbeat_due(now) {
            self.write(Payload::Heartbeat, now, effects);
            if self.closed {
                return;
            }
        }
        let transport = self.transport.as_ref();
        transfer::emit(&mut self.queue, transport, &self.config, now);
        transfer::report_ack(&mut self.queue, transport);
        transfer::flush(&self.queue, transport);
    }

    fn write(&mut self, payload: Payload, now: Instant, effects: &mut Vec<Effect>) {
        if self.closed {
            return;
        }
        if let Err(e) = transfer::write(
            &mut self.queue,
            self.transport.as_ref(),
            &self.config,
            payload,
            now,
        ) {
            warn!("Session {}: {}", self.session_id, e);
            self.close(CloseReason::CacheOverflow, true, effects);
        }
    }

    fn reply(&mut self, transport: &T, response: ConnectResponse) {
        if response.success {
            self.queue.mark_ack_reported();
        }
        transport.write_and_flush(Frame::ConnectResponse(response));
    }

    fn close(&mut self, reason: CloseReason, notify: bool, effects: &mut Vec<Effect>) {
        if self.closed {
            return;
        }
        if let Some(transport) = self.transport.take() {
            if notify {
                transport.write_and_flush(Frame::ConnectResponse(ConnectResponse::close(
                    self.session_id,
                    self.queue.ack(),
                )));
            }
            transport.close();
        }
        self.queue.clean_message_queue();
        self.closed = true;
        info!("Session {} closed: {}", self.session_id, reason);
        effects.push(Effect::Closed(reason));
    }
}
