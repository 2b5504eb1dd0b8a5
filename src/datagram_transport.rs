use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a composed datagram to a peer, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// One datagram socket is typically shared by all connections of a process: it must
///  support concurrent sends from multiple connections, and its owner demultiplexes
///  inbound datagrams by peer address before forwarding them to the matching
///  connection's `on_datagram`.
///
/// Sending is best effort by nature, so this interface reports no errors - an
///  implementation logs failures and moves on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl DatagramTransport for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
