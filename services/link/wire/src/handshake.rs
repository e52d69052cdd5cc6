//! Handshake records exchanged while (re)binding a session to a transport.

use serde::{Deserialize, Serialize};

/// Handshake attempt sent by the connecting side.
///
/// `verifying_times` counts attempts sent, `verified_times` counts attempts
/// that succeeded; together they let the acceptor reject replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Session identity the acceptor keys on
    pub session_id: u64,
    /// Handshake attempts sent so far, including this one
    pub verifying_times: u64,
    /// Handshake attempts that succeeded before this one
    pub verified_times: u64,
    /// Sequence preceding the sender's first message
    pub init_sequence: u64,
    /// Next sequence the sender expects, zero before the first success
    pub ack: u64,
    /// Graceful close notification instead of a handshake
    pub is_close: bool,
}

/// Handshake verdict sent by the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Session identity echoed from the request
    pub session_id: u64,
    /// Whether the attempt was accepted
    pub success: bool,
    /// Echo of the request's `verifying_times`
    pub verifying_times: u64,
    /// Echo of the request's `verified_times`
    pub verified_times: u64,
    /// Sequence preceding the acceptor's first message
    pub init_sequence: u64,
    /// Next sequence the acceptor expects
    pub ack: u64,
    /// Graceful close notification instead of a verdict
    pub is_close: bool,
}

impl ConnectRequest {
    /// Build a close notification for `session_id`
    pub fn close(session_id: u64, ack: u64) -> Self {
        Self {
            session_id,
            verifying_times: 0,
            verified_times: 0,
            init_sequence: 0,
            ack,
            is_close: true,
        }
    }
}

impl ConnectResponse {
    /// Build a failure verdict echoing `request`
    pub fn reject(request: &ConnectRequest) -> Self {
        Self {
            session_id: request.session_id,
            success: false,
            verifying_times: request.verifying_times,
            verified_times: request.verified_times,
            init_sequence: 0,
            ack: 0,
            is_close: false,
        }
    }

    /// Build a close notification for `session_id`
    pub fn close(session_id: u64, ack: u64) -> Self {
        Self {
            session_id,
            success: false,
            verifying_times: 0,
            verified_times: 0,
            init_sequence: 0,
            ack,
            is_close: true,
        }
    }

    /// Whether this response answers `request`
    pub fn answers(&self, request: &ConnectRequest) -> bool {
        self.session_id == request.session_id
            && self.verifying_times == request.verifying_times
            && self.verified_times == request.verified_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            session_id: 9,
            verifying_times: 3,
            verified_times: 2,
            init_sequence: 100,
            ack: 55,
            is_close: false,
        }
    }

    #[test]
    fn test_reject_answers_its_request() {
        let req = request();
        let verdict = ConnectResponse::reject(&req);
        assert!(!verdict.success);
        assert!(!verdict.is_close);
        assert!(verdict.answers(&req));

        let later = ConnectRequest {
            verifying_times: 4,
            ..req
        };
        assert!(!verdict.answers(&later));
        let other_session = ConnectRequest {
            session_id: 10,
            ..req
        };
        assert!(!verdict.answers(&other_session));
    }

    #[test]
    fn test_close_records() {
        let request = ConnectRequest::close(9, 77);
        assert!(request.is_close);
        assert_eq!(request.ack, 77);

        let response = ConnectResponse::close(9, 78);
        assert!(response.is_close);
        assert!(!response.success);
        assert_eq!(response.ack, 78);
    }
}
