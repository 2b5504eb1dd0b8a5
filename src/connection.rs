use crate::config::ConnectionConfig;
use crate::datagram_channel::DatagramChannel;
use crate::datagram_transport::DatagramTransport;
use crate::frame;
use crate::listener::ConnectionListener;
use crate::stream_channel::{QueuedPacket, ReceiveCursor, SendQueue};
use crate::stream_transport::StreamTransport;
use anyhow::bail;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, Instant};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Connection is the place where the per-peer parts of the protocol come together: it
///  drives the stream channel's read loop and FIFO send queue, the redundant datagram
///  channel, the idle keep-alive timer, and the connection's lifecycle.
///
/// A connection is created around an established stream transport (and the process-wide
///  datagram transport) once a peer is accepted or dialed; creation itself does no I/O.
///  [Connection::start] spawns the read loop and the keep-alive timer. [Connection::close]
///  tears everything down; it is idempotent, and it is also triggered internally by read
///  or write failures.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    config: ConnectionConfig,
    peer_addr: SocketAddr,
    stream_transport: Arc<dyn StreamTransport>,
    datagram_transport: Arc<dyn DatagramTransport>,
    datagram_channel: DatagramChannel,

    /// pending stream packets - NB: this lock and the datagram channel's lock are
    ///  deliberately independent, so one channel never blocks on the other
    send_queue: Mutex<SendQueue>,
    /// when the most recent stream send was *requested* - the keep-alive timer measures
    ///  idleness from here
    last_stream_send: Mutex<Instant>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,

    started: AtomicBool,
    /// `Open -> Closed` is the connection's entire lifecycle; the watch channel doubles
    ///  as the exactly-once guard for closure and as the wake-up for the loops
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        stream_transport: Arc<dyn StreamTransport>,
        datagram_transport: Arc<dyn DatagramTransport>,
        peer_addr: SocketAddr,
        config: ConnectionConfig,
    ) -> anyhow::Result<Connection> {
        config.validate()?;

        Ok(Connection {
            shared: Arc::new(ConnectionShared {
                datagram_channel: DatagramChannel::new(config.max_payload_len),
                config,
                peer_addr,
                stream_transport,
                datagram_transport,
                send_queue: Mutex::new(SendQueue::default()),
                last_stream_send: Mutex::new(Instant::now()),
                listeners: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                closed: watch::Sender::new(false),
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Registers a listener for this connection's events.
    pub async fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.listeners.write().await
            .push(listener);
    }

    /// Spawns the connection's read loop and its keep-alive timer. Idempotent - there is
    ///  never more than one read in flight per connection.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!("connection to {:?} started more than once - ignoring", self.shared.peer_addr);
            return;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.read_loop().await });

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.keep_alive_loop().await });
    }

    /// Sends a payload on the reliable ordered channel. Payloads sent back-to-back reach
    ///  the peer in call order; `on_sent` is notified once the payload has been handed to
    ///  the transport.
    ///
    /// This registers the payload and returns; the actual write happens on the
    ///  connection's single-writer drain task. A write failure closes the connection
    ///  rather than surfacing here.
    pub async fn send_stream(&self, payload: &[u8]) -> anyhow::Result<()> {
        self.shared.enqueue_stream_send(payload).await
    }

    /// Sends a payload on the unreliable datagram channel, piggybacking up to
    ///  `redundancy` previously sent packets so the peer can recover from isolated
    ///  datagram loss. Callers tune `redundancy` against its bandwidth cost.
    pub async fn send_datagram(&self, payload: &[u8], redundancy: usize) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("connection to {:?} is closed", self.shared.peer_addr);
        }

        let datagram = self.shared.datagram_channel.compose(payload, redundancy).await?;
        self.shared.datagram_transport.send_datagram(self.shared.peer_addr, &datagram).await;
        Ok(())
    }

    /// Entry point for inbound datagrams, called by the datagram transport's owner after
    ///  demultiplexing by peer address.
    pub async fn on_datagram(&self, datagram: Bytes) {
        if self.is_closed() {
            trace!("dropping datagram for closed connection to {:?}", self.shared.peer_addr);
            return;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        let shared = self.shared.clone();
        async move {
            for payload in shared.datagram_channel.accept(datagram).await {
                shared.notify_received(&payload).await;
            }
        }
            .instrument(span)
            .await
    }

    /// Closes the connection: stops the timer and the read loop, abandons unsent stream
    ///  packets, releases the stream transport and notifies `closed` listeners. Safe to
    ///  call any number of times; everything happens exactly once.
    pub async fn close(&self) {
        self.shared.do_close().await
    }
}

impl ConnectionShared {
    async fn read_loop(self: Arc<Self>) {
        debug!("starting read loop for connection to {:?}", self.peer_addr);

        let mut cursor = ReceiveCursor::new(self.config.max_payload_len);
        let mut closed_rx = self.closed.subscribe();

        loop {
            if *closed_rx.borrow_and_update() {
                break;
            }

            let chunk = tokio::select! {
                _ = closed_rx.changed() => continue,
                result = self.stream_transport.read_chunk(self.config.read_buffer_len) => match result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("read error on connection to {:?}: {}", self.peer_addr, e);
                        break;
                    }
                },
            };

            if chunk.is_empty() {
                debug!("peer {:?} closed the stream", self.peer_addr);
                break;
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "stream_chunk_received", ?correlation_id);

            if let Err(e) = self.process_chunk(&mut cursor, chunk).instrument(span).await {
                warn!("protocol error on connection to {:?}: {:#} - closing", self.peer_addr, e);
                break;
            }
        }

        self.do_close().await;
    }

    /// Scans one received chunk through the cursor. A chunk may complete any number of
    ///  payloads; each one is dispatched before scanning continues.
    async fn process_chunk(&self, cursor: &mut ReceiveCursor, chunk: Bytes) -> anyhow::Result<()> {
        trace!("received chunk of {} bytes from {:?}", chunk.len(), self.peer_addr);

        for &byte in chunk.iter() {
            if let Some(payload) = cursor.push(byte)? {
                self.notify_received(&payload).await;
            }
        }
        Ok(())
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let mut closed_rx = self.closed.subscribe();
        let mut timer = interval(self.config.keep_alive_interval);
        timer.tick().await; // the first tick completes immediately

        loop {
            if *closed_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = closed_rx.changed() => continue,
                _ = timer.tick() => {}
            }

            let idle_for = self.last_stream_send.lock().await.elapsed();
            if idle_for < self.config.idle_threshold {
                continue;
            }

            trace!("connection to {:?} idle for {:?} - sending keep-alive", self.peer_addr, idle_for);
            if let Err(e) = self.enqueue_stream_send(&[]).await {
                // closed concurrently - the flag check above ends the loop
                debug!("keep-alive send failed: {:#}", e);
            }
        }
    }

    async fn enqueue_stream_send(self: &Arc<Self>, payload: &[u8]) -> anyhow::Result<()> {
        if *self.closed.borrow() {
            bail!("connection to {:?} is closed", self.peer_addr);
        }
        if payload.len() > self.config.max_payload_len {
            bail!("stream payload of length {} exceeds the configured maximum of {}", payload.len(), self.config.max_payload_len);
        }

        trace!("registering stream payload of length {} for sending to {:?}", payload.len(), self.peer_addr);
        *self.last_stream_send.lock().await = Instant::now();

        let packet = QueuedPacket {
            encoded: frame::encode_stream_packet(payload),
            payload: Bytes::copy_from_slice(payload),
        };

        let became_writer = self.send_queue.lock().await.enqueue(packet);
        if became_writer {
            let shared = self.clone();
            tokio::spawn(async move { shared.drain_send_queue().await });
        }
        Ok(())
    }

    /// The stream channel's single writer: pops queued packets and writes them until the
    ///  queue runs dry. At most one of these exists per connection at any time, which is
    ///  what makes stream delivery strictly FIFO.
    async fn drain_send_queue(self: Arc<Self>) {
        loop {
            let next = self.send_queue.lock().await.next_or_finish();
            let Some(packet) = next else {
                break;
            };

            trace!("writing stream packet of {} bytes to {:?}", packet.encoded.len(), self.peer_addr);
            if let Err(e) = self.stream_transport.write_chunk(&packet.encoded).await {
                debug!("write error on connection to {:?}: {}", self.peer_addr, e);
                self.do_close().await;
                break;
            }

            self.notify_sent(&packet.payload).await;
        }
    }

    async fn notify_received(&self, payload: &[u8]) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_received(payload).await {
                warn!("error in received listener for {:?}: {:#}", self.peer_addr, e);
            }
        }
    }

    async fn notify_sent(&self, payload: &[u8]) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_sent(payload).await {
                warn!("error in sent listener for {:?}: {:#}", self.peer_addr, e);
            }
        }
    }

    async fn do_close(self: &Arc<Self>) {
        let newly_closed = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            }
            else {
                *closed = true;
                true
            }
        });
        if !newly_closed {
            return;
        }

        info!("closing connection to {:?}", self.peer_addr);

        let num_abandoned = self.send_queue.lock().await.clear();
        if num_abandoned > 0 {
            debug!("abandoning {} unsent stream packets for {:?}", num_abandoned, self.peer_addr);
        }

        self.stream_transport.shutdown().await;

        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_closed().await {
                warn!("error in closed listener for {:?}: {:#}", self.peer_addr, e);
            }
        }
    }
}
