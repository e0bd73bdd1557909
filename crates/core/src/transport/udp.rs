use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use super::DatagramSink;
use crate::error::Result;

/// UDP transport for RTP packet delivery.
///
/// Wraps one socket. Once [`connect`](Self::connect)ed to a peer it acts as a
/// [`DatagramSink`]; [`send_to`](Self::send_to) addresses any peer
/// explicitly. [`recv`](Self::recv) is a plain blocking read so the caller's
/// receive loop can feed a receiver.
///
/// This layer is address-only: it knows nothing about streams or SSRCs.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind to `addr` (use port 0 for an ephemeral port).
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        tracing::debug!(local = ?socket.local_addr().ok(), "UDP transport bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Fix the default destination used by [`DatagramSink::send`].
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.socket.connect(addr)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Block until one datagram arrives; returns its length and origin.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf)?)
    }
}

impl DatagramSink for UdpTransport {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        let sent = self.socket.send(datagram)?;
        if sent != datagram.len() {
            tracing::warn!(sent, len = datagram.len(), "short UDP write");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_send_and_recv() {
        let rx = UdpTransport::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let tx = UdpTransport::bind("127.0.0.1:0").unwrap();
        tx.connect(rx.local_addr().unwrap()).unwrap();

        DatagramSink::send(&tx, &[0x80, 96, 0, 1]).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 96, 0, 1]);
        assert_eq!(from, tx.local_addr().unwrap());
    }
}
