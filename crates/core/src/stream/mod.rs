//! Sender and receiver pipelines for one H.264 RTP stream.
//!
//! ```text
//!           ┌──────────────── RtpVideoSender ───────────────┐
//! AU ──────▶│ H264Packetizer ─▶ PayloadCipher ─▶ DatagramSink│──▶ network
//!           └───────────────────────────────────────────────┘
//!           ┌──────────────── RtpVideoReceiver ─────────────┐
//! network ─▶│ ReceptionStats ─▶ ReorderBuffer ─▶ FrameAssembler│──▶ AU
//!           └───────────────────────────────────────────────┘
//! ```
//!
//! RTCP flows beside the media: the sender builds SRs and consumes RRs (RTT),
//! the receiver consumes SRs and builds RRs (loss, jitter, LSR/DLSR echo).

pub mod receiver;
pub mod sender;

pub use receiver::RtpVideoReceiver;
pub use sender::RtpVideoSender;
