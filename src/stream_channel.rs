use crate::frame::LengthDecoder;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::trace;

/// Incremental receive state for the stream channel: a two-phase cursor that is either
///  accumulating a length prefix or filling a payload buffer.
///
/// Exactly one instance exists per connection, and only the connection's read loop ever
///  touches it - so it needs no lock.
pub struct ReceiveCursor {
    max_payload_len: usize,
    phase: Phase,
}

enum Phase {
    Length(LengthDecoder),
    Payload { buf: BytesMut, target_len: usize },
}

impl ReceiveCursor {
    pub fn new(max_payload_len: usize) -> ReceiveCursor {
        ReceiveCursor {
            max_payload_len,
            phase: Phase::Length(LengthDecoder::default()),
        }
    }

    /// Feeds one received byte into the cursor, returning a payload if this byte
    ///  completed one.
    ///
    /// An error means the peer violated the framing protocol (or the configured payload
    ///  bound); the cursor is not recoverable, and the caller is expected to close the
    ///  connection.
    pub fn push(&mut self, byte: u8) -> anyhow::Result<Option<Bytes>> {
        match &mut self.phase {
            Phase::Length(decoder) => {
                match decoder.push(byte)? {
                    None => Ok(None),
                    Some(len) if len > self.max_payload_len => {
                        bail!("stream packet length {} exceeds the configured maximum of {}", len, self.max_payload_len);
                    }
                    Some(0) => {
                        trace!("received empty stream payload");
                        Ok(Some(Bytes::new()))
                    }
                    Some(len) => {
                        self.phase = Phase::Payload { buf: BytesMut::with_capacity(len), target_len: len };
                        Ok(None)
                    }
                }
            }
            Phase::Payload { buf, target_len } => {
                buf.put_u8(byte);
                if buf.len() < *target_len {
                    return Ok(None);
                }
                let payload = std::mem::take(buf).freeze();
                trace!("received stream payload of length {}", payload.len());
                self.phase = Phase::Length(LengthDecoder::default());
                Ok(Some(payload))
            }
        }
    }
}

/// One stream packet awaiting transmission: the framed bytes for the wire, and the
///  original payload for the `sent` notification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueuedPacket {
    pub encoded: Bytes,
    pub payload: Bytes,
}

/// The stream channel's FIFO send queue.
///
/// This is pure bookkeeping behind the connection's send-queue lock; the actual writes
///  happen in a drain task owned by the connection. Invariants: queue order equals
///  send-call order, and `write_in_flight` is true iff exactly one drain task exists.
#[derive(Default)]
pub struct SendQueue {
    queue: VecDeque<QueuedPacket>,
    write_in_flight: bool,
}

impl SendQueue {
    /// Appends a packet to the queue tail. Returns true iff the caller just became the
    ///  writer, i.e. no write was in flight and the caller must start the drain.
    pub fn enqueue(&mut self, packet: QueuedPacket) -> bool {
        self.queue.push_back(packet);
        if self.write_in_flight {
            false
        }
        else {
            self.write_in_flight = true;
            true
        }
    }

    /// Called by the drain task to get the next packet to write. Clears the
    ///  write-in-flight flag when the queue is empty - the drain task must terminate in
    ///  that case.
    pub fn next_or_finish(&mut self) -> Option<QueuedPacket> {
        let next = self.queue.pop_front();
        if next.is_none() {
            self.write_in_flight = false;
        }
        next
    }

    /// Abandons all pending packets without error, returning how many were dropped.
    ///  Part of closing the connection.
    pub fn clear(&mut self) -> usize {
        let num_abandoned = self.queue.len();
        self.queue.clear();
        num_abandoned
    }
}
