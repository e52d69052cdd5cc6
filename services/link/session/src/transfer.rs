//! Flow control between the cache, the pending window and the wire.
//!
//! These functions hold no state of their own. Every call takes the
//! session's [`MessageQueue`] and the currently bound transport, which is
//! `None` while the session has no usable connection; in that case outgoing
//! payloads simply wait in the cache.

use link_wire::{BatchMessage, Frame, Payload, SingleMessage, HEADER_SIZE};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::queue::MessageQueue;
use crate::session::SessionConfig;
use crate::transport::Transport;

/// Per-entry bytes in a batch body: sequence, kind and length prefix
const BATCH_ENTRY_OVERHEAD: usize = 8 + 1 + 4;
/// Length prefix, header and entry count of a batch frame
const BATCH_FRAME_OVERHEAD: usize = 4 + HEADER_SIZE + 4;

/// Fatal flow-control failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// More messages are waiting than the cache may hold
    #[error("send cache overflow: {limit} messages already waiting")]
    CacheOverflow {
        /// Configured cache capacity
        limit: usize,
    },
}

/// Accept an outgoing payload from the application.
///
/// Goes straight to the wire when the window has room, the transport is
/// writable and nothing is cached ahead of it; otherwise it is cached. A
/// heartbeat is skipped when the outgoing stream already ends in one.
pub fn write<T: Transport>(
    queue: &mut MessageQueue,
    transport: Option<&T>,
    config: &SessionConfig,
    payload: Payload,
    now: Instant,
) -> Result<(), TransferError> {
    if payload.is_heartbeat() && queue.tail_is_heartbeat() {
        trace!("Skipping heartbeat, one is already queued");
        return Ok(());
    }

    let window_open = queue.pending().len() < config.max_pending_messages;
    if let Some(transport) = transport {
        if window_open && transport.is_writable() && queue.cache().is_empty() {
            let sequence = queue.push_pending(payload.clone(), now + config.ack_timeout);
            transport.write(Frame::Single(SingleMessage {
                ack: queue.ack(),
                sequence,
                payload,
            }));
            queue.mark_ack_reported();
            return Ok(());
        }
    }

    if queue.cache().len() >= config.max_cache_messages {
        return Err(TransferError::CacheOverflow {
            limit: config.max_cache_messages,
        });
    }
    queue.push_cache(payload);

    // The peer only acks what it has received; push out the full window.
    if let Some(transport) = transport {
        if !window_open && queue.cache().len() == 1 && transport.is_writable() {
            transport.flush();
        }
    }
    Ok(())
}

/// Move cached payloads into the pending window and send them.
///
/// One ready payload goes out as a single frame; two or more are coalesced
/// into batch frames. The last frame flushes the transport.
pub fn emit<T: Transport>(
    queue: &mut MessageQueue,
    transport: Option<&T>,
    config: &SessionConfig,
    now: Instant,
) {
    let Some(transport) = transport else {
        return;
    };
    if queue.cache().is_empty() || !transport.is_writable() {
        return;
    }

    let room = config
        .max_pending_messages
        .saturating_sub(queue.pending().len());
    let count = room.min(queue.cache().len());
    if count == 0 {
        return;
    }

    let deadline = now + config.ack_timeout;
    let mut entries = Vec::with_capacity(count);
    while entries.len() < count {
        let Some(payload) = queue.pop_cache() else {
            break;
        };
        let sequence = queue.push_pending(payload.clone(), deadline);
        entries.push((sequence, payload));
    }

    debug!(
        "Emitting {} cached messages, {} still cached",
        entries.len(),
        queue.cache().len()
    );
    send_entries(queue, transport, entries, config.max_frame_size);
}

/// Flush the transport once nothing is left waiting for window space
pub fn flush<T: Transport>(queue: &MessageQueue, transport: Option<&T>) {
    if let Some(transport) = transport {
        if !queue.pending().is_empty() && queue.cache().is_empty() {
            transport.flush();
        }
    }
}

/// Retransmit the whole pending window after a (re)verification.
///
/// Refreshes every ack deadline and clears `traced`; the cache is untouched.
pub fn resend<T: Transport>(
    queue: &mut MessageQueue,
    transport: &T,
    config: &SessionConfig,
    now: Instant,
) {
    if queue.pending().is_empty() {
        return;
    }

    let deadline = now + config.ack_timeout;
    let mut entries = Vec::with_capacity(queue.pending().len());
    for message in queue.pending_mut().iter_mut() {
        message.ack_deadline = deadline;
        message.traced = false;
        entries.push((message.sequence, message.payload.clone()));
    }

    debug!("Resending {} pending messages", entries.len());
    send_entries(queue, transport, entries, config.max_frame_size);
}

/// Accept one inbound sequenced message.
///
/// Returns the payload to deliver, or `None` when the message was dropped as
/// out of order, duplicate, or carrying an ack that refers to nothing in flight.
pub fn read_message<T: Transport>(
    queue: &mut MessageQueue,
    transport: Option<&T>,
    config: &SessionConfig,
    message: SingleMessage,
    now: Instant,
) -> Option<Payload> {
    let delivered = accept(queue, message.ack, message.sequence, message.payload);
    if delivered.is_some() {
        emit(queue, transport, config, now);
    }
    delivered
}

/// Accept every entry of an inbound batch, in order
pub fn read_batch<T: Transport>(
    queue: &mut MessageQueue,
    transport: Option<&T>,
    config: &SessionConfig,
    batch: BatchMessage,
    now: Instant,
) -> Vec<Payload> {
    let ack = batch.ack;
    let delivered: Vec<Payload> = batch
        .entries
        .into_iter()
        .filter_map(|(sequence, payload)| accept(queue, ack, sequence, payload))
        .collect();
    if !delivered.is_empty() {
        emit(queue, transport, config, now);
    }
    delivered
}

/// Apply a bare ack from the peer
pub fn read_ack<T: Transport>(
    queue: &mut MessageQueue,
    transport: Option<&T>,
    config: &SessionConfig,
    ack: u64,
    now: Instant,
) {
    if !queue.is_ack_ok(ack) {
        warn!(
            "Dropping ack {} outside pending window (next sequence {})",
            ack,
            queue.peek_next_sequence()
        );
        return;
    }
    if queue.update_pending_queue(ack) > 0 {
        emit(queue, transport, config, now);
    }
}

/// Send a bare ack if inbound messages were accepted since the last outbound frame
pub fn report_ack<T: Transport>(queue: &mut MessageQueue, transport: Option<&T>) {
    let Some(transport) = transport else {
        return;
    };
    if queue.ack_unreported() && transport.is_writable() {
        trace!("Reporting ack {}", queue.ack());
        transport.write_and_flush(Frame::Heartbeat { ack: queue.ack() });
        queue.mark_ack_reported();
    }
}

/// Whether the oldest pending message just missed its ack deadline.
///
/// Marks the entry `traced` so the same expiry is reported only once.
pub fn check_ack_timeout(queue: &mut MessageQueue, now: Instant) -> bool {
    match queue.pending_mut().front_mut() {
        Some(head) if !head.traced && head.ack_deadline <= now => {
            head.traced = true;
            true
        }
        _ => false,
    }
}

fn accept(queue: &mut MessageQueue, ack: u64, sequence: u64, payload: Payload) -> Option<Payload> {
    if sequence != queue.ack() {
        trace!(
            "Dropping out-of-order message {} (expecting {})",
            sequence,
            queue.ack()
        );
        return None;
    }
    if !queue.is_ack_ok(ack) {
        warn!(
            "Dropping message {} with ack {} outside pending window",
            sequence, ack
        );
        return None;
    }

    let Some(next) = sequence.checked_add(1) else {
        warn!("Dropping message {}: sequence space exhausted", sequence);
        return None;
    };

    queue.update_pending_queue(ack);
    queue.set_ack(next);
    Some(payload)
}

/// Write `entries` as a single frame or as size-bounded batches, flushing the last one
fn send_entries<T: Transport>(
    queue: &mut MessageQueue,
    transport: &T,
    entries: Vec<(u64, Payload)>,
    max_frame_size: usize,
) {
    let ack = queue.ack();
    queue.mark_ack_reported();

    if entries.len() == 1 {
        if let Some((sequence, payload)) = entries.into_iter().next() {
            transport.write_and_flush(Frame::Single(SingleMessage {
                ack,
                sequence,
                payload,
            }));
        }
        return;
    }

    let mut frames = Vec::new();
    let mut batch = Vec::new();
    let mut batch_size = BATCH_FRAME_OVERHEAD;
    for (sequence, payload) in entries {
        let entry_size = BATCH_ENTRY_OVERHEAD + payload.len();
        if !batch.is_empty() && batch_size + entry_size > max_frame_size {
            frames.push(std::mem::take(&mut batch));
            batch_size = BATCH_FRAME_OVERHEAD;
        }
        batch_size += entry_size;
        batch.push((sequence, payload));
    }
    frames.push(batch);

    let last = frames.len() - 1;
    for (index, entries) in frames.into_iter().enumerate() {
        let frame = Frame::Batch(BatchMessage { ack, entries });
        if index == last {
            transport.write_and_flush(frame);
        } else {
            transport.write(frame);
        }
    }
}
