//! H.264 video over RTP.
//!
//! Turns Annex-B access units into RFC 6184 packets and back, keeps RFC 3550
//! reception statistics with SR/RR exchange, and negotiates the session and
//! key-frame requests over a reliable control channel.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rtpvideo::{
//!     BufferPool, EncodedAccessUnit, NoopCipher, RtpVideoSender, SenderConfig, UdpTransport,
//! };
//!
//! # fn main() -> rtpvideo::Result<()> {
//! let transport = UdpTransport::bind("0.0.0.0:0")?;
//! transport.connect("127.0.0.1:5004")?;
//! let sender = RtpVideoSender::new(
//!     SenderConfig::default(),
//!     Arc::new(NoopCipher),
//!     Arc::new(transport),
//! )?;
//!
//! let pool = BufferPool::default();
//! let idr = [0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00];
//! let au = EncodedAccessUnit::from_annex_b(&pool, &idr, true, 0, 0)?;
//! sender.send(&au)?;
//! # Ok(())
//! # }
//! ```

pub mod access_unit;
pub mod cipher;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod pool;
pub mod rtcp;
pub mod stream;
pub mod transport;

pub use access_unit::EncodedAccessUnit;
pub use cipher::{NoopCipher, PacketMetadata, PayloadCipher, XorTestCipher};
pub use config::{ReceiverConfig, SenderConfig, VideoSessionConfig};
pub use error::{MalformedKind, Result, VideoError};
pub use media::assembler::FrameAssembler;
pub use media::h264::H264Packetizer;
pub use media::reorder::ReorderBuffer;
pub use media::sequence::SequenceGenerator;
pub use media::{VideoDecoder, VideoEncoder};
pub use negotiation::{
    ControlChannel, InMemoryControlChannel, NegotiationManager, NegotiationState, SessionAnswer,
    SessionOffer,
};
pub use pool::{BufferPool, PooledBuffer};
pub use rtcp::stats::VideoStreamStats;
pub use stream::{RtpVideoReceiver, RtpVideoSender};
pub use transport::{DatagramSink, UdpTransport};
