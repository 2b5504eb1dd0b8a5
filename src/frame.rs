use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tracing::debug;

/// The smallest possible datagram sub-packet: a one-byte length prefix plus the two
///  sequence number bytes. Anything shorter at the end of a datagram is a truncated
///  remainder and cannot be interpreted.
pub const MIN_SUB_PACKET_LEN: usize = 3;

/// Encodes a payload for the stream channel: varint length prefix, then the payload.
pub fn encode_stream_packet(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_usize_varint(payload.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// Encodes a payload for the datagram channel: varint length prefix, sequence number,
///  then the payload. The length prefix counts only the payload bytes.
pub fn encode_datagram_packet(payload: &[u8], seq: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 7);
    buf.put_usize_varint(payload.len());
    buf.put_u16(seq);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental decoder for a varint length prefix on the stream channel.
///
/// A length prefix may straddle the boundary between two reads, so this accumulates one
///  byte at a time instead of requiring a contiguous buffer. Whole-buffer decoding (the
///  datagram side) goes through `bytes-varint` instead.
#[derive(Debug, Default)]
pub struct LengthDecoder {
    value: u64,
    shift: u32,
}

impl LengthDecoder {
    /// Feeds one byte into the decoder, returning the decoded length if this byte
    ///  completed it.
    pub fn push(&mut self, byte: u8) -> anyhow::Result<Option<usize>> {
        if self.shift >= 64 {
            bail!("varint length prefix does not fit in 64 bits");
        }
        self.value |= ((byte & 0x7f) as u64) << self.shift;
        self.shift += 7;

        if byte & 0x80 != 0 {
            return Ok(None);
        }

        let value = self.value;
        *self = LengthDecoder::default();
        if value > usize::MAX as u64 {
            bail!("varint length prefix {} exceeds the address space", value);
        }
        Ok(Some(value as usize))
    }
}

/// One sub-packet decoded from an inbound datagram.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubPacket {
    pub seq: u16,
    pub payload: Bytes,
}

/// Decodes the back-to-back sub-packets of one inbound datagram, in wire order (newest
///  first).
///
/// The datagram channel is best effort, so anything that cannot be interpreted - a
///  truncated trailing sub-packet, or a length prefix above `max_payload_len` - ends the
///  scan silently; the sub-packets decoded up to that point are returned.
pub fn decode_datagram(mut buf: Bytes, max_payload_len: usize) -> Vec<SubPacket> {
    let mut sub_packets = Vec::new();

    while buf.len() >= MIN_SUB_PACKET_LEN {
        let mut rest = buf.clone();
        let payload_len = match rest.try_get_usize_varint() {
            Ok(len) => len,
            Err(_) => {
                debug!("truncated length prefix at the end of a datagram - discarding remainder");
                return sub_packets;
            }
        };
        if payload_len > max_payload_len {
            debug!("sub-packet length {} exceeds the configured maximum of {} - discarding remainder", payload_len, max_payload_len);
            return sub_packets;
        }
        let seq = match rest.try_get_u16() {
            Ok(seq) => seq,
            Err(_) => {
                debug!("truncated sequence number at the end of a datagram - discarding remainder");
                return sub_packets;
            }
        };
        if rest.remaining() < payload_len {
            debug!("truncated sub-packet payload at the end of a datagram - discarding remainder");
            return sub_packets;
        }
        let payload = rest.copy_to_bytes(payload_len);
        sub_packets.push(SubPacket { seq, payload });
        buf = rest;
    }

    sub_packets
}
