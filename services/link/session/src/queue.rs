//! Per-session sequencing state: send counter, receive cursor, pending window and cache.
//!
//! A `MessageQueue` is owned by exactly one session task and never shared.
//! Sequences are assigned when a payload leaves the cache, so `pending` is
//! always a contiguous run ending just below `next_sequence`.

use link_wire::Payload;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::trace;

/// A message handed to the transport and awaiting the peer's ack
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Sequence assigned when the message left the cache
    pub sequence: u64,
    /// Message body
    pub payload: Payload,
    /// Instant by which the peer must have acknowledged this message
    pub ack_deadline: Instant,
    /// Set once an expired deadline on this entry has been reported
    pub traced: bool,
}

/// Outgoing sequence state and incoming cursor for one session
#[derive(Debug)]
pub struct MessageQueue {
    init_sequence: u64,
    next_sequence: u64,
    ack: u64,
    reported_ack: u64,
    pending: VecDeque<QueuedMessage>,
    cache: VecDeque<Payload>,
}

impl MessageQueue {
    /// Create a queue whose first outgoing message gets `init_sequence + 1`
    pub fn new(init_sequence: u64) -> Self {
        Self {
            init_sequence,
            next_sequence: init_sequence + 1,
            ack: 0,
            reported_ack: 0,
            pending: VecDeque::new(),
            cache: VecDeque::new(),
        }
    }

    /// Create a queue with a random initial sequence
    pub fn with_random_init() -> Self {
        // Keep well below u64::MAX so sequence arithmetic never wraps.
        let init_sequence = rand::thread_rng().gen_range(0..u64::from(u32::MAX));
        Self::new(init_sequence)
    }

    /// Sequence preceding the first outgoing message
    pub fn init_sequence(&self) -> u64 {
        self.init_sequence
    }

    /// Return the next outgoing sequence and advance the counter
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Sequence the next outgoing message will receive
    pub fn peek_next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Whether a peer-reported ack refers to messages this side actually has in flight.
    ///
    /// Accepts `[first pending, last pending + 1]`, or exactly `next_sequence`
    /// when nothing is pending.
    pub fn is_ack_ok(&self, ack: u64) -> bool {
        match self.pending.front() {
            Some(first) => first.sequence <= ack && ack <= self.next_sequence,
            None => ack == self.next_sequence,
        }
    }

    /// Retire every pending entry below `ack`; returns how many were retired
    pub fn update_pending_queue(&mut self, ack: u64) -> usize {
        let mut retired = 0;
        while self
            .pending
            .front()
            .is_some_and(|message| message.sequence < ack)
        {
            self.pending.pop_front();
            retired += 1;
        }
        if retired > 0 {
            trace!("Retired {} pending messages below ack {}", retired, ack);
        }
        retired
    }

    /// Set the next sequence expected from the peer
    pub fn set_ack(&mut self, ack: u64) {
        self.ack = ack;
    }

    /// Next sequence expected from the peer
    pub fn ack(&self) -> u64 {
        self.ack
    }

    /// Record that the current ack has been carried by an outgoing frame
    pub fn mark_ack_reported(&mut self) {
        self.reported_ack = self.ack;
    }

    /// Whether messages were accepted since the ack was last put on the wire
    pub fn ack_unreported(&self) -> bool {
        self.reported_ack != self.ack
    }

    /// Drop every pending and cached entry
    pub fn clean_message_queue(&mut self) {
        self.pending.clear();
        self.cache.clear();
    }

    /// Messages awaiting the peer's ack, oldest first
    pub fn pending(&self) -> &VecDeque<QueuedMessage> {
        &self.pending
    }

    /// Mutable access to the pending window
    pub fn pending_mut(&mut self) -> &mut VecDeque<QueuedMessage> {
        &mut self.pending
    }

    /// Messages accepted but not yet handed to the transport
    pub fn cache(&self) -> &VecDeque<Payload> {
        &self.cache
    }

    /// Append a payload behind everything already cached
    pub fn push_cache(&mut self, payload: Payload) {
        self.cache.push_back(payload);
    }

    /// Take the oldest cached payload
    pub fn pop_cache(&mut self) -> Option<Payload> {
        self.cache.pop_front()
    }

    /// Assign a sequence to `payload`, append it to the pending window and return the sequence
    pub fn push_pending(&mut self, payload: Payload, ack_deadline: Instant) -> u64 {
        let sequence = self.next_sequence();
        self.pending.push_back(QueuedMessage {
            sequence,
            payload,
            ack_deadline,
            traced: false,
        });
        sequence
    }

    /// Whether the most recently queued outgoing payload is a heartbeat still worth waiting on
    pub fn tail_is_heartbeat(&self) -> bool {
        match self.cache.back() {
            Some(payload) => payload.is_heartbeat(),
            None => self
                .pending
                .back()
                .is_some_and(|message| message.payload.is_heartbeat() && !message.traced),
        }
    }
}
