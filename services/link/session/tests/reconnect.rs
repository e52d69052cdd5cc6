//! Connector and acceptor driven against each other over in-memory transports.

use bytes::Bytes;
use link_session::{
    AcceptedSession, CloseReason, Connector, ConnectorState, Effect, MemoryTransport, MessageQueue,
    SessionConfig, Transport,
};
use link_wire::{ConnectRequest, ConnectResponse, Frame, Payload};
use std::time::{Duration, Instant};

const SESSION: u64 = 0xC0FFEE;

/// One simulated connection: what each side writes lands in its own end
struct Link {
    client_end: MemoryTransport,
    server_end: MemoryTransport,
}

impl Link {
    fn new() -> Self {
        Self {
            client_end: MemoryTransport::new(),
            server_end: MemoryTransport::new(),
        }
    }
}

struct Harness {
    config: SessionConfig,
    now: Instant,
    connector: Connector<MemoryTransport>,
    acceptor: Option<AcceptedSession<MemoryTransport>>,
    link: Option<Link>,
    client_effects: Vec<Effect>,
    server_effects: Vec<Effect>,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let now = Instant::now();
        Self {
            connector: Connector::with_queue(SESSION, config.clone(), MessageQueue::new(1000), now),
            config,
            now,
            acceptor: None,
            link: None,
            client_effects: Vec::new(),
            server_effects: Vec::new(),
        }
    }

    fn acceptor(&self) -> &AcceptedSession<MemoryTransport> {
        self.acceptor.as_ref().expect("session not created")
    }

    /// Start the connector and run until both sides are quiet
    fn establish(&mut self) {
        let mut effects = Vec::new();
        self.connector.start(self.now, &mut effects);
        self.client_effects.extend(effects);
        self.pump();
        assert_eq!(self.connector.state(), ConnectorState::Verified);
    }

    /// Answer dials and move frames both ways until nothing moves
    fn pump(&mut self) {
        loop {
            let mut moved = self.answer_dials();
            let Some(link) = self.link.as_ref() else {
                return;
            };
            let (client_end, server_end) = (link.client_end.clone(), link.server_end.clone());

            for frame in client_end.drain() {
                moved = true;
                self.to_server(&server_end, frame);
            }
            for frame in server_end.drain() {
                moved = true;
                let mut effects = Vec::new();
                self.connector
                    .on_frame(client_end.id(), frame, self.now, &mut effects);
                self.client_effects.extend(effects);
            }
            if !moved {
                return;
            }
        }
    }

    fn to_server(&mut self, server_end: &MemoryTransport, frame: Frame) {
        let mut effects = Vec::new();
        match (self.acceptor.as_mut(), frame) {
            (None, Frame::ConnectRequest(request)) => {
                self.acceptor = AcceptedSession::with_queue(
                    self.config.clone(),
                    MessageQueue::new(5000),
                    &request,
                    server_end.clone(),
                    self.now,
                )
                .ok();
            }
            (Some(acceptor), Frame::ConnectRequest(request)) => {
                acceptor.on_connect(&request, server_end.clone(), self.now, &mut effects);
            }
            (Some(acceptor), frame) => {
                acceptor.on_frame(server_end.id(), frame, self.now, &mut effects);
            }
            (None, _) => {}
        }
        self.server_effects.extend(effects);
    }

    fn answer_dials(&mut self) -> bool {
        let dials: Vec<u64> = self
            .client_effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Dial { attempt } => Some(*attempt),
                _ => None,
            })
            .collect();
        self.client_effects
            .retain(|effect| !matches!(effect, Effect::Dial { .. }));

        for attempt in &dials {
            let link = Link::new();
            let mut effects = Vec::new();
            self.connector
                .on_dialed(*attempt, Some(link.client_end.clone()), self.now, &mut effects);
            self.link = Some(link);
            self.client_effects.extend(effects);
        }
        !dials.is_empty()
    }

    /// Drop the connection; frames still in flight are lost
    fn sever(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        link.client_end.close();
        link.server_end.close();

        let mut effects = Vec::new();
        self.connector
            .on_lost(link.client_end.id(), self.now, &mut effects);
        self.client_effects.extend(effects);
        if let Some(acceptor) = self.acceptor.as_mut() {
            acceptor.on_lost(link.server_end.id());
        }
    }

    fn send(&mut self, text: &str) {
        let mut effects = Vec::new();
        self.connector
            .send(Bytes::copy_from_slice(text.as_bytes()), self.now, &mut effects);
        self.client_effects.extend(effects);
    }

    fn tick_server(&mut self) {
        let mut effects = Vec::new();
        if let Some(acceptor) = self.acceptor.as_mut() {
            acceptor.tick(self.now, &mut effects);
        }
        self.server_effects.extend(effects);
    }

    fn delivered_to_server(&self) -> Vec<Bytes> {
        self.server_effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver(Payload::Data(data)) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_reconnect_preserves_order_without_duplicates() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.establish();

    assert_eq!(harness.connector.verified_times(), 1);
    assert_eq!(harness.connector.queue().ack(), 5001);
    assert_eq!(harness.acceptor().queue().ack(), 1001);
    assert_eq!(harness.client_effects, vec![Effect::Established]);

    for text in ["m1", "m2", "m3", "m4", "m5"] {
        harness.send(text);
    }

    // Only the first two messages reach the acceptor before the connection drops
    let link = harness.link.as_ref().unwrap();
    let (client_end, server_end) = (link.client_end.clone(), link.server_end.clone());
    let frames = client_end.drain();
    assert_eq!(frames.len(), 5);
    for frame in frames.into_iter().take(2) {
        harness.to_server(&server_end, frame);
    }
    assert_eq!(harness.delivered_to_server().len(), 2);
    harness.sever();
    assert!(matches!(
        harness.connector.state(),
        ConnectorState::Connecting { .. }
    ));
    assert_eq!(harness.connector.queue().pending().len(), 5);

    harness.pump();

    assert_eq!(harness.connector.state(), ConnectorState::Verified);
    assert_eq!(harness.connector.verified_times(), 2);
    assert_eq!(harness.acceptor().verified_times(), 1);
    assert_eq!(
        harness.delivered_to_server(),
        vec!["m1", "m2", "m3", "m4", "m5"]
            .into_iter()
            .map(Bytes::from)
            .collect::<Vec<_>>()
    );
    // Both sides observed the rebind as a heartbeat
    assert!(harness
        .client_effects
        .contains(&Effect::Deliver(Payload::Heartbeat)));
    assert!(harness
        .server_effects
        .contains(&Effect::Deliver(Payload::Heartbeat)));

    // The trimmed remainder is pending until the acceptor reports its ack
    assert_eq!(harness.connector.queue().pending().len(), 3);
    harness.tick_server();
    harness.pump();
    assert!(harness.connector.queue().pending().is_empty());
}

#[test]
fn test_traffic_in_both_directions_after_reconnect() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.establish();

    let mut effects = Vec::new();
    let acceptor = harness.acceptor.as_mut().unwrap();
    acceptor.send(Bytes::from_static(b"down-1"), harness.now, &mut effects);
    acceptor.send(Bytes::from_static(b"down-2"), harness.now, &mut effects);

    // Lost before the connector saw them
    harness.sever();
    harness.pump();

    let delivered: Vec<Effect> = harness
        .client_effects
        .iter()
        .filter(|effect| matches!(effect, Effect::Deliver(Payload::Data(_))))
        .cloned()
        .collect();
    assert_eq!(
        delivered,
        vec![
            Effect::Deliver(Payload::Data(Bytes::from_static(b"down-1"))),
            Effect::Deliver(Payload::Data(Bytes::from_static(b"down-2"))),
        ]
    );
    assert_eq!(harness.connector.queue().ack(), 5003);
}

#[test]
fn test_replayed_handshake_rejected_and_queue_unchanged() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.establish();
    harness.send("kept");
    harness.sever();
    harness.pump();
    assert_eq!(harness.acceptor().verifying_times(), 2);

    let pending_before: Vec<u64> = harness
        .acceptor()
        .queue()
        .pending()
        .iter()
        .map(|m| m.sequence)
        .collect();
    let ack_before = harness.acceptor().queue().ack();

    // A delayed copy of the very first handshake shows up on a new connection
    let replay = ConnectRequest {
        session_id: SESSION,
        verifying_times: 1,
        verified_times: 0,
        init_sequence: 1000,
        ack: 0,
        is_close: false,
    };
    let stray = MemoryTransport::new();
    let mut effects = Vec::new();
    harness
        .acceptor
        .as_mut()
        .unwrap()
        .on_connect(&replay, stray.clone(), harness.now, &mut effects);

    assert!(effects.is_empty());
    assert!(matches!(
        stray.drain().as_slice(),
        [Frame::ConnectResponse(ConnectResponse { success: false, .. })]
    ));
    let acceptor = harness.acceptor();
    assert!(!acceptor.is_closed());
    assert_eq!(acceptor.verifying_times(), 2);
    assert_eq!(acceptor.queue().ack(), ack_before);
    let pending_after: Vec<u64> = acceptor.queue().pending().iter().map(|m| m.sequence).collect();
    assert_eq!(pending_before, pending_after);
    let bound = harness.link.as_ref().unwrap().server_end.id();
    assert_eq!(acceptor.transport().map(Transport::id), Some(bound));
}

#[test]
fn test_overflow_while_disconnected_closes_session() {
    let config = SessionConfig {
        max_pending_messages: 2,
        max_cache_messages: 3,
        ..SessionConfig::default()
    };
    let mut harness = Harness::new(config.clone());
    harness.establish();
    harness.sever();
    // Leave the redial unanswered
    harness.client_effects.clear();

    for text in ["a", "b", "c"] {
        harness.send(text);
    }
    assert!(!harness.connector.is_closed());

    harness.send("d");
    assert!(harness.connector.is_closed());
    assert_eq!(
        harness.client_effects.last(),
        Some(&Effect::Closed(CloseReason::CacheOverflow))
    );
    assert!(harness.connector.queue().cache().is_empty());
    assert!(harness.delivered_to_server().is_empty());

    // The orphaned acceptor is reclaimed by its idle timeout
    harness.now += config.idle_timeout + Duration::from_secs(1);
    harness.tick_server();
    assert_eq!(
        harness.server_effects.last(),
        Some(&Effect::Closed(CloseReason::IdleTimeout))
    );
}
