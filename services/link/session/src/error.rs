//! Session error types.

use crate::session::CloseReason;
use link_wire::{CodecError, WireError};
use thiserror::Error;

/// Errors surfaced to the application
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session never became usable
    #[error("connect failed: {0}")]
    ConnectFailed(CloseReason),

    /// The session task has ended
    #[error("session closed")]
    Closed,

    /// Payload cannot fit in one frame
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Offered payload size
        size: usize,
        /// Largest accepted payload
        limit: usize,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Frame encoding error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}
