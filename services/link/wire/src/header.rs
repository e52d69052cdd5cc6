//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 20-byte header carrying the frame type and the
//! piggybacked cumulative ack, so the session layer can retire pending
//! messages without parsing the body.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Handshake attempt sent by the connecting side
    ConnectRequest = 0x01,
    /// Handshake verdict sent by the accepting side
    ConnectResponse = 0x02,
    /// One sequenced message
    Single = 0x03,
    /// Several sequenced messages sharing one ack
    Batch = 0x04,
    /// Bare ack carrier, no sequence
    Heartbeat = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::ConnectRequest),
            0x02 => Ok(FrameType::ConnectResponse),
            0x03 => Ok(FrameType::Single),
            0x04 => Ok(FrameType::Batch),
            0x05 => Ok(FrameType::Heartbeat),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Single frame carries the heartbeat marker instead of data
        const HEARTBEAT = 1 << 0;
    }
}

/// Frame header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame type
    pub typ: FrameType,
    /// Frame flags
    pub flags: Flags,
    /// Next sequence the sender expects from its peer
    pub ack: u64,
    /// Sequence of a Single frame, zero otherwise
    pub sequence: u64,
}

impl Header {
    /// Create a header with no flags set
    pub fn new(typ: FrameType, ack: u64, sequence: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            ack,
            sequence,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u64(self.ack);
        buf.put_u64(self.sequence);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::Reserved)?;
        let ack = buf.get_u64();
        let sequence = buf.get_u64();

        Ok(Self {
            ver,
            typ,
            flags,
            ack,
            sequence,
        })
    }
}
