//! Wire protocol framing, headers and codecs for the link session protocol.
//!
//! This crate provides the byte-level representation of the handshake and
//! message frames exchanged by link sessions. It knows nothing about
//! sequencing rules or retransmission; those live in `link-session`.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-------------------------------------------+
//! | u32 frame_len        | length of bytes that follow               |
//! +----------------------+-------------------------------------------+
//! | Header (20B)         | ver | type | flags | ack u64 | sequence u64 |
//! +----------------------+-------------------------------------------+
//! | body                 | CBOR handshake, raw payload or batch      |
//! +----------------------+-------------------------------------------+
//! ```
//!
//! ## Frames
//!
//! - **ConnectRequest / ConnectResponse**: handshake records, CBOR encoded
//! - **Single**: one sequenced payload with a piggybacked ack
//! - **Batch**: `u32 count` then `u64 seq | u8 kind | u32 len | bytes` per entry
//! - **Heartbeat**: header only, carries an ack and no sequence

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;

// Re-export main types
pub use codec::{decode_cbor, encode_cbor, CodecError};
pub use error::WireError;
pub use frame::{
    BatchMessage, Frame, FrameDecoder, Payload, SingleMessage, DEFAULT_MAX_FRAME_SIZE,
    HARD_MAX_FRAME_SIZE,
};
pub use handshake::{ConnectRequest, ConnectResponse};
pub use header::{Flags, FrameType, Header, HEADER_SIZE, WIRE_VERSION};
