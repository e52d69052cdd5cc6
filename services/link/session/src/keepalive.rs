//! Heartbeat pacing and inbound idle tracking.
//!
//! Heartbeats are ordinary sequenced payloads (see `transfer::write`); this
//! module only decides when one is due and when the peer has gone quiet.

use std::time::{Duration, Instant};

/// Keepalive state for one session
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    idle_timeout: Duration,
    last_sent: Instant,
    last_inbound: Instant,
}

impl Keepalive {
    /// Start tracking from `now`
    pub fn new(interval: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            idle_timeout,
            last_sent: now,
            last_inbound: now,
        }
    }

    /// Whether a heartbeat should be written; records the send when it is
    pub fn heartbeat_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_sent) >= self.interval {
            self.last_sent = now;
            true
        } else {
            false
        }
    }

    /// Record inbound traffic
    pub fn touch(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Whether nothing has arrived for longer than the idle timeout
    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_inbound) >= self.idle_timeout
    }

    /// Time since the last inbound frame
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_inbound)
    }
}
