//! Message framing for the wire protocol.
//!
//! This module provides the logical frame shapes exchanged by the session
//! layer and the length-prefixed encoding that carries them over a stream.

use crate::codec::{batch_body_len, decode_batch_body, decode_cbor, encode_batch_body, encode_cbor};
use crate::handshake::{ConnectRequest, ConnectResponse};
use crate::header::{Flags, FrameType, Header, HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

/// Maximum frame size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Unit of sequenced traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Keep-alive marker; acknowledged like data but never handed to the application
    Heartbeat,
    /// Application bytes
    Data(Bytes),
}

impl Payload {
    /// Number of payload bytes carried on the wire
    pub fn len(&self) -> usize {
        match self {
            Payload::Heartbeat => 0,
            Payload::Data(data) => data.len(),
        }
    }

    /// Whether the payload carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is the heartbeat marker
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Payload::Heartbeat)
    }
}

/// One sequenced message with a piggybacked ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleMessage {
    /// Next sequence the sender expects
    pub ack: u64,
    /// Sequence of this message
    pub sequence: u64,
    /// Message body
    pub payload: Payload,
}

/// Several sequenced messages sharing one ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMessage {
    /// Next sequence the sender expects
    pub ack: u64,
    /// Messages in increasing sequence order
    pub entries: Vec<(u64, Payload)>,
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake attempt or close notification from the connector
    ConnectRequest(ConnectRequest),
    /// Handshake verdict or close notification from the acceptor
    ConnectResponse(ConnectResponse),
    /// One sequenced message
    Single(SingleMessage),
    /// Several sequenced messages
    Batch(BatchMessage),
    /// Bare ack, carries no sequence
    Heartbeat {
        /// Next sequence the sender expects
        ack: u64,
    },
}

impl Frame {
    /// Frame type tag of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectRequest(_) => FrameType::ConnectRequest,
            Frame::ConnectResponse(_) => FrameType::ConnectResponse,
            Frame::Single(_) => FrameType::Single,
            Frame::Batch(_) => FrameType::Batch,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
        }
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::CodecError> {
        let (header, body) = match self {
            Frame::ConnectRequest(request) => (
                Header::new(FrameType::ConnectRequest, request.ack, 0),
                encode_cbor(request)?,
            ),
            Frame::ConnectResponse(response) => (
                Header::new(FrameType::ConnectResponse, response.ack, 0),
                encode_cbor(response)?,
            ),
            Frame::Single(message) => {
                let mut header = Header::new(FrameType::Single, message.ack, message.sequence);
                let body = match &message.payload {
                    Payload::Heartbeat => {
                        header.flags |= Flags::HEARTBEAT;
                        Bytes::new()
                    }
                    Payload::Data(data) => data.clone(),
                };
                (header, body)
            }
            Frame::Batch(message) => {
                let mut body = BytesMut::with_capacity(batch_body_len(&message.entries));
                encode_batch_body(&message.entries, &mut body);
                (Header::new(FrameType::Batch, message.ack, 0), body.freeze())
            }
            Frame::Heartbeat { ack } => (Header::new(FrameType::Heartbeat, *ack, 0), Bytes::new()),
        };

        let total_size = 4 + HEADER_SIZE + body.len();
        if total_size > max_frame_size {
            return Err(crate::WireError::Size(total_size).into());
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - 4) as u32);
        header.encode(&mut buf);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit, capped at the hard limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len + 4 > self.max_frame_size {
            debug!(
                "Rejecting frame of {} bytes (limit {})",
                frame_len, self.max_frame_size
            );
            return Err(crate::WireError::Size(frame_len));
        }
        if frame_len < HEADER_SIZE {
            debug!("Rejecting frame shorter than its header ({} bytes)", frame_len);
            return Err(crate::WireError::Malformed);
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let header = Header::decode(&mut frame_buf)?;
        let body = frame_buf;

        let frame = match header.typ {
            FrameType::ConnectRequest => {
                Frame::ConnectRequest(decode_cbor::<ConnectRequest>(&body).map_err(|e| {
                    debug!("Invalid connect request body: {}", e);
                    crate::WireError::Handshake
                })?)
            }
            FrameType::ConnectResponse => {
                Frame::ConnectResponse(decode_cbor::<ConnectResponse>(&body).map_err(|e| {
                    debug!("Invalid connect response body: {}", e);
                    crate::WireError::Handshake
                })?)
            }
            FrameType::Single => {
                let payload = if header.flags.contains(Flags::HEARTBEAT) {
                    if !body.is_empty() {
                        return Err(crate::WireError::Malformed);
                    }
                    Payload::Heartbeat
                } else {
                    Payload::Data(body)
                };
                Frame::Single(SingleMessage {
                    ack: header.ack,
                    sequence: header.sequence,
                    payload,
                })
            }
            FrameType::Batch => Frame::Batch(BatchMessage {
                ack: header.ack,
                entries: decode_batch_body(body)?,
            }),
            FrameType::Heartbeat => {
                if !body.is_empty() {
                    return Err(crate::WireError::Malformed);
                }
                Frame::Heartbeat { ack: header.ack }
            }
        };

        trace!("Decoded {:?} frame of {} bytes", header.typ, frame_len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn test_single_heartbeat_flag() {
        let frame = Frame::Single(SingleMessage {
            ack: 3,
            sequence: 11,
            payload: Payload::Heartbeat,
        });
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(bytes.len(), 4 + HEADER_SIZE);

        assert_eq!(decode_all(&bytes), vec![frame]);
    }

    #[test]
    fn test_stream_of_mixed_frames() {
        let request = ConnectRequest {
            session_id: 1,
            verifying_times: 1,
            verified_times: 0,
            init_sequence: 99,
            ack: 0,
            is_close: false,
        };
        let frames = vec![
            Frame::ConnectRequest(request),
            Frame::Batch(BatchMessage {
                ack: 7,
                entries: vec![
                    (100, Payload::Data(Bytes::from_static(b"one"))),
                    (101, Payload::Data(Bytes::from_static(b"two"))),
                ],
            }),
            Frame::Heartbeat { ack: 8 },
        ];

        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        }

        assert_eq!(decode_all(&wire), frames);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = Frame::Single(SingleMessage {
            ack: 1,
            sequence: 2,
            payload: Payload::Data(Bytes::from_static(b"hello world")),
        });
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[10..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_encode_respects_size_limit() {
        let frame = Frame::Single(SingleMessage {
            ack: 0,
            sequence: 1,
            payload: Payload::Data(Bytes::from(vec![0u8; 64])),
        });
        assert!(frame.encode(32).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut decoder = FrameDecoder::with_max_frame_size(64);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::Size(1024))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_handshake_body() {
        let mut buf = BytesMut::new();
        buf.put_u32((HEADER_SIZE + 2) as u32);
        Header::new(FrameType::ConnectResponse, 0, 0).encode(&mut buf);
        buf.put_slice(&[0xff, 0xff]);

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::Handshake)
        ));
    }
}
