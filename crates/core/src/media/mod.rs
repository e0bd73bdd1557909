//! H.264 over RTP: packetization, reordering and frame reassembly.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame (access unit) is split into one or more RTP
//! packets. Every RTP packet carries a 12-byte fixed header
//! ([`rtp::RtpHeader`]) containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): 90 kHz media clock, shared by all packets of a frame.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! ## Data path
//!
//! ```text
//! sender:   EncodedAccessUnit ─▶ H264Packetizer ─▶ cipher ─▶ datagrams
//! receiver: datagrams ─▶ ReorderBuffer ─▶ FrameAssembler ─▶ EncodedAccessUnit
//! ```
//!
//! | Stage | Module | RFC |
//! |-------|--------|-----|
//! | Packetize | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | Reorder | [`reorder`] | [RFC 3550 §A.1](https://tools.ietf.org/html/rfc3550#appendix-A.1) |
//! | Reassemble | [`assembler`] | [RFC 6184 §5.8](https://tools.ietf.org/html/rfc6184#section-5.8) |

pub mod assembler;
pub mod h264;
pub mod reorder;
pub mod rtp;
pub mod sequence;

use crate::access_unit::EncodedAccessUnit;

/// Encoder hook driven by the transport.
///
/// The core never encodes; it only asks the attached encoder for a fresh
/// IDR when the remote side reports picture loss.
pub trait VideoEncoder: Send + Sync {
    fn request_key_frame(&self);
}

/// Decoder sink for reassembled access units.
pub trait VideoDecoder: Send + Sync {
    fn submit(&self, access_unit: EncodedAccessUnit);
}
