//! A per-peer connection that multiplexes two channels over a pair of transports:
//!
//! * a *reliable ordered* channel: arbitrary-sized payloads, framed and sent over a reliable
//!   byte stream (typically TCP), delivered strictly in send order
//! * an *unreliable datagram* channel: low-latency payloads sent over a datagram socket
//!   (typically UDP), with bounded tolerance to isolated packet loss - and no retransmission
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *payloads* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * The reliable channel adds nothing but framing: ordering and delivery guarantees come
//!   from the underlying stream transport
//! * The datagram channel mitigates loss through *redundancy* rather than retransmission:
//!   every outgoing datagram piggybacks the most recently sent packets, so a receiver can
//!   recover a lost datagram from one of its successors without a round trip
//!   * with redundancy `N`, any single lost datagram among `N+1` consecutive sends is
//!     recovered; longer loss runs are tolerated probabilistically as `N` grows
//!   * redundancy is a per-send parameter, so callers can tune the bandwidth cost per payload
//! * Datagram traffic and stream traffic never block each other - the two channels have
//!   fully independent locking
//! * An idle connection sends periodic empty keep-alive payloads on the stream channel to
//!   keep intermediate NAT / firewall mappings alive
//! * Closure is idempotent and observable: no matter whether a connection is closed by the
//!   application, by a read error / EOF or by a write error, resources are released once and
//!   `closed` listeners are notified exactly once
//! * Explicitly *not* goals: retransmission-based reliability for the datagram channel,
//!   congestion control, encryption, multi-path support
//!
//! ## Wire format
//!
//! All length prefixes are base-128 varints: each byte carries 7 value bits (least
//! significant group first), the high bit flags a continuation byte.
//!
//! Stream channel - a self-describing sequence of packets inside the byte stream:
//!
//! ```ascii
//! 0: payload length (varint)
//! *: payload bytes
//! ```
//!
//! Datagram channel - one datagram is the back-to-back concatenation of one or more
//! sub-packets, newest first. Each sub-packet:
//!
//! ```ascii
//! 0: payload length (varint) - the length of the payload *without* the sequence number
//! *: sequence number (u16 BE) - per-connection counter, strictly increasing mod 65536
//! *: payload bytes
//! ```
//!
//! A receiver classifies each sub-packet as new or stale by the sign of the wrapping
//! 16-bit difference to the last accepted sequence number. Within one datagram, previously
//! missing sub-packets are dispatched oldest first, the freshest sub-packet last, so the
//! application observes gaps being backfilled before the newest data.
//!
//! ## Collaborators
//!
//! The connection does not own sockets. It talks to a [stream_transport::StreamTransport]
//! for the reliable channel and hands composed datagrams to a
//! [datagram_transport::DatagramTransport], which is typically a single UDP socket shared
//! by all connections of a process. Demultiplexing inbound datagrams by peer address is the
//! socket owner's job; it forwards them to [connection::Connection::on_datagram].

pub mod config;
pub mod connection;
pub mod datagram_channel;
pub mod datagram_transport;
pub mod frame;
pub mod listener;
pub mod stream_channel;
pub mod stream_transport;
