//! Handshake rules shared by the connecting and accepting sides.
//!
//! The records themselves live in `link-wire`; this module decides whether a
//! request may (re)bind a session and builds the matching responses.

use link_wire::{ConnectRequest, ConnectResponse};
use std::fmt;

use crate::queue::MessageQueue;

/// Why the acceptor refused a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `verifying_times` did not increase
    Stale {
        /// Highest value already accepted
        seen: u64,
        /// Value in the request
        got: u64,
    },
    /// `verified_times` is neither the recorded value nor one past it
    VersionMismatch {
        /// Recorded value
        recorded: u64,
        /// Value in the request
        got: u64,
    },
    /// First-time verification that does not match the session's origin
    InitMismatch,
    /// The peer's initial sequence leaves no room for a first message
    InitOverflow(u64),
    /// The peer acknowledges messages this side never had in flight
    BadAck(u64),
    /// The session is already closed
    Closed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Stale { seen, got } => {
                write!(f, "stale verifying_times {} (last seen {})", got, seen)
            }
            Rejection::VersionMismatch { recorded, got } => {
                write!(f, "verified_times {} does not follow {}", got, recorded)
            }
            Rejection::InitMismatch => f.write_str("initial sequence mismatch"),
            Rejection::InitOverflow(init) => write!(f, "initial sequence {} overflows", init),
            Rejection::BadAck(ack) => write!(f, "ack {} outside pending window", ack),
            Rejection::Closed => f.write_str("session closed"),
        }
    }
}

/// Whether `request` asks for a brand new session
pub fn is_new_connect(request: &ConnectRequest) -> bool {
    request.verified_times == 0 && request.ack == 0 && !request.is_close
}

/// Receive cursor for a peer whose first message follows `init_sequence`
pub fn origin_ack(init_sequence: u64) -> Result<u64, Rejection> {
    init_sequence
        .checked_add(1)
        .ok_or(Rejection::InitOverflow(init_sequence))
}

/// Check a connect request against an existing session's recorded counters
pub fn validate_reconnect(
    request: &ConnectRequest,
    last_verifying_times: u64,
    last_verified_times: u64,
    queue: &MessageQueue,
) -> Result<(), Rejection> {
    if request.verifying_times <= last_verifying_times {
        return Err(Rejection::Stale {
            seen: last_verifying_times,
            got: request.verifying_times,
        });
    }

    if request.verified_times != last_verified_times
        && request.verified_times != last_verified_times + 1
    {
        return Err(Rejection::VersionMismatch {
            recorded: last_verified_times,
            got: request.verified_times,
        });
    }

    if request.verified_times == 0 {
        if request.ack != 0 || origin_ack(request.init_sequence) != Ok(queue.ack()) {
            return Err(Rejection::InitMismatch);
        }
    } else if !queue.is_ack_ok(request.ack) {
        return Err(Rejection::BadAck(request.ack));
    }

    Ok(())
}

/// Success verdict for `request`, carrying this side's origin and receive cursor
pub fn accept_response(request: &ConnectRequest, queue: &MessageQueue) -> ConnectResponse {
    ConnectResponse {
        session_id: request.session_id,
        success: true,
        verifying_times: request.verifying_times,
        verified_times: request.verified_times,
        init_sequence: queue.init_sequence(),
        ack: queue.ack(),
        is_close: false,
    }
}
