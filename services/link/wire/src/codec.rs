//! Body encoding for the wire protocol.
//!
//! Handshake records travel as canonical CBOR; batched messages use a compact
//! length-prefixed layout so a flush of N pending messages costs one frame.

use crate::frame::Payload;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Batch entry kind for application data
pub const ENTRY_KIND_DATA: u8 = 0;
/// Batch entry kind for the heartbeat marker
pub const ENTRY_KIND_HEARTBEAT: u8 = 1;

/// Per-entry overhead in a batch body: sequence, kind, length
const ENTRY_OVERHEAD: usize = 8 + 1 + 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// CBOR encoding error
    #[error("cbor encoding failed")]
    CborEncode,
    /// CBOR decoding error
    #[error("cbor decoding failed")]
    CborDecode,
}

/// Encode a serde value as CBOR
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|_| CodecError::CborEncode)?;
    Ok(Bytes::from(buf))
}

/// Decode a serde value from CBOR
pub fn decode_cbor<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(raw).map_err(|_| CodecError::CborDecode)
}

/// Encoded size of a batch body
pub fn batch_body_len(entries: &[(u64, Payload)]) -> usize {
    4 + entries
        .iter()
        .map(|(_, payload)| ENTRY_OVERHEAD + payload.len())
        .sum::<usize>()
}

/// Encode batch entries into `buf`
pub fn encode_batch_body(entries: &[(u64, Payload)], buf: &mut BytesMut) {
    buf.put_u32(entries.len() as u32);
    for (sequence, payload) in entries {
        buf.put_u64(*sequence);
        match payload {
            Payload::Heartbeat => {
                buf.put_u8(ENTRY_KIND_HEARTBEAT);
                buf.put_u32(0);
            }
            Payload::Data(data) => {
                buf.put_u8(ENTRY_KIND_DATA);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

/// Decode batch entries from a frame body
pub fn decode_batch_body(mut body: Bytes) -> Result<Vec<(u64, Payload)>, crate::WireError> {
    if body.len() < 4 {
        return Err(crate::WireError::Malformed);
    }

    let count = body.get_u32() as usize;
    // Each entry needs at least its fixed overhead; reject counts the body cannot hold.
    if count > body.len() / ENTRY_OVERHEAD {
        return Err(crate::WireError::Malformed);
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if body.len() < ENTRY_OVERHEAD {
            return Err(crate::WireError::Malformed);
        }
        let sequence = body.get_u64();
        let kind = body.get_u8();
        let len = body.get_u32() as usize;
        if body.len() < len {
            return Err(crate::WireError::Malformed);
        }
        let data = body.split_to(len);

        let payload = match kind {
            ENTRY_KIND_DATA => Payload::Data(data),
            ENTRY_KIND_HEARTBEAT if len == 0 => Payload::Heartbeat,
            ENTRY_KIND_HEARTBEAT => return Err(crate::WireError::Malformed),
            other => return Err(crate::WireError::Kind(other)),
        };
        entries.push((sequence, payload));
    }

    if !body.is_empty() {
        return Err(crate::WireError::Malformed);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ConnectRequest;

    #[test]
    fn test_cbor_handshake() {
        let request = ConnectRequest {
            session_id: 7,
            verifying_times: 3,
            verified_times: 1,
            init_sequence: 1000,
            ack: 55,
            is_close: false,
        };

        let raw = encode_cbor(&request).unwrap();
        let decoded: ConnectRequest = decode_cbor(&raw).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_cbor_rejects_garbage() {
        let result: Result<ConnectRequest, _> = decode_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::CborDecode)));
    }

    #[test]
    fn test_batch_body_layout() {
        let entries = vec![
            (5, Payload::Data(Bytes::from_static(b"abc"))),
            (6, Payload::Heartbeat),
        ];

        let mut buf = BytesMut::new();
        encode_batch_body(&entries, &mut buf);
        assert_eq!(buf.len(), batch_body_len(&entries));

        let decoded = decode_batch_body(buf.freeze()).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_batch_body_truncated() {
        let entries = vec![(9, Payload::Data(Bytes::from_static(b"payload")))];
        let mut buf = BytesMut::new();
        encode_batch_body(&entries, &mut buf);
        buf.truncate(buf.len() - 2);

        assert!(decode_batch_body(buf.freeze()).is_err());
    }

    #[test]
    fn test_batch_body_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u64(1);
        buf.put_u8(7);
        buf.put_u32(0);

        assert!(matches!(
            decode_batch_body(buf.freeze()),
            Err(crate::WireError::Kind(7))
        ));
    }
}
