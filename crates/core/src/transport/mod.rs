//! Outbound datagram seam.
//!
//! The core never owns a receive loop; it only needs somewhere to put the
//! packets it produces. [`DatagramSink`] is that collaborator:
//!
//! - **UDP** ([`udp`]): a connected or address-directed socket.
//! - **Closures**: any `Fn(&[u8]) -> Result<()>` is a sink, which is how
//!   in-process loopbacks and tests capture packets.
//!
//! Received datagrams are pushed into
//! [`RtpVideoReceiver`](crate::stream::RtpVideoReceiver) by whoever owns the
//! socket.

pub mod udp;

pub use udp::UdpTransport;

use crate::error::Result;

/// Destination for outgoing RTP/RTCP datagrams.
pub trait DatagramSink: Send + Sync {
    fn send(&self, datagram: &[u8]) -> Result<()>;
}

impl<F> DatagramSink for F
where
    F: Fn(&[u8]) -> Result<()> + Send + Sync,
{
    fn send(&self, datagram: &[u8]) -> Result<()> {
        self(datagram)
    }
}
