//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown flag bits set
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown frame type
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown batch entry kind
    #[error("unknown entry kind {0}")]
    Kind(u8),

    /// Handshake body could not be decoded
    #[error("handshake body invalid")]
    Handshake,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
