//! Basic usage example for the link wire protocol.

use bytes::{Bytes, BytesMut};
use link_wire::{
    BatchMessage, ConnectRequest, Frame, FrameDecoder, Payload, SingleMessage,
    DEFAULT_MAX_FRAME_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Link Wire Protocol Example ===\n");

    // 1. Handshake request
    println!("1. Encoding a CONNECT_REQUEST...");
    let request = ConnectRequest {
        session_id: 42,
        verifying_times: 1,
        verified_times: 0,
        init_sequence: 1000,
        ack: 0,
        is_close: false,
    };
    let mut wire = BytesMut::new();
    let bytes = Frame::ConnectRequest(request).encode(DEFAULT_MAX_FRAME_SIZE)?;
    println!("   Encoded frame size: {} bytes", bytes.len());
    wire.extend_from_slice(&bytes);

    // 2. A single message and a batch
    println!("\n2. Encoding SINGLE and BATCH frames...");
    let single = Frame::Single(SingleMessage {
        ack: 501,
        sequence: 1001,
        payload: Payload::Data(Bytes::from_static(b"Hello, link!")),
    });
    let batch = Frame::Batch(BatchMessage {
        ack: 501,
        entries: vec![
            (1002, Payload::Data(Bytes::from_static(b"second"))),
            (1003, Payload::Heartbeat),
        ],
    });
    for frame in [&single, &batch] {
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE)?;
        println!("   {:?}: {} bytes", frame.frame_type(), bytes.len());
        wire.extend_from_slice(&bytes);
    }

    // 3. Decode everything back
    println!("\n3. Decoding the stream...");
    let mut decoder = FrameDecoder::new();
    while let Some(frame) = decoder.decode(&mut wire)? {
        match frame {
            Frame::ConnectRequest(req) => {
                println!(
                    "   CONNECT_REQUEST session={} init_seq={}",
                    req.session_id, req.init_sequence
                )
            }
            Frame::Single(msg) => println!(
                "   SINGLE seq={} ack={} len={}",
                msg.sequence,
                msg.ack,
                msg.payload.len()
            ),
            Frame::Batch(msg) => println!("   BATCH ack={} entries={}", msg.ack, msg.entries.len()),
            other => println!("   {:?}", other.frame_type()),
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
