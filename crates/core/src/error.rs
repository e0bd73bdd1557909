//! Error types for the RTP video transport core.

use std::fmt;

/// Errors that can occur in the video transport core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`MalformedPacket`](Self::MalformedPacket): short or
///   inconsistent RTP/RTCP datagrams.
/// - **Reassembly**: [`FragmentGap`](Self::FragmentGap),
///   [`CapacityExceeded`](Self::CapacityExceeded).
/// - **Security**: [`Cipher`](Self::Cipher): per-packet encrypt/decrypt failure.
/// - **Control plane**: [`NegotiationParse`](Self::NegotiationParse),
///   [`ChannelClosed`](Self::ChannelClosed).
/// - **Resources**: [`PoolExhausted`](Self::PoolExhausted), the only class
///   that must reach the caller.
///
/// RTP delivery is best-effort, so everything [`is_recoverable`](Self::is_recoverable)
/// is logged and discarded by the pipelines rather than returned.
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram could not be parsed as RTP or RTCP.
    #[error("malformed packet: {kind}")]
    MalformedPacket { kind: MalformedKind },

    /// FU-A continuation without a matching start, inconsistent NAL type,
    /// or a sequence gap inside one frame.
    #[error("fragment gap in frame with timestamp {timestamp}")]
    FragmentGap { timestamp: u32 },

    /// Too many frames were being assembled at once; the oldest was dropped.
    #[error("concurrent assembly limit of {limit} exceeded")]
    CapacityExceeded { limit: usize },

    /// The payload cipher rejected a packet or produced an inconsistent length.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// A control message was not valid negotiation JSON.
    #[error("negotiation message parse error: {0}")]
    NegotiationParse(#[from] serde_json::Error),

    /// No pooled buffer could be handed out without exceeding the pool limit.
    #[error("buffer pool exhausted ({limit} buffers outstanding)")]
    PoolExhausted { limit: usize },

    /// Access unit bytes do not begin with an Annex-B start code.
    #[error("access unit does not start with an Annex-B start code")]
    InvalidAccessUnit,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The control channel peer has gone away.
    #[error("control channel closed")]
    ChannelClosed,
}

impl VideoError {
    pub(crate) fn malformed(kind: MalformedKind) -> Self {
        Self::MalformedPacket { kind }
    }

    /// Whether the error is scoped to one packet or message and can be
    /// discarded locally.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::PoolExhausted { .. } | Self::Io(_) | Self::ChannelClosed
        )
    }
}

/// Specific kind of malformed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Shorter than the fixed header (or the header plus CSRC/extension).
    Truncated,
    /// Version field was not 2.
    BadVersion,
    /// Padding count larger than the payload.
    BadPadding,
    /// RTCP length field disagrees with the datagram or the packet type.
    BadLength,
    /// RTCP packet type or NAL unit type this crate does not handle.
    UnsupportedType(u8),
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated header"),
            Self::BadVersion => write!(f, "version is not 2"),
            Self::BadPadding => write!(f, "invalid padding"),
            Self::BadLength => write!(f, "length field mismatch"),
            Self::UnsupportedType(pt) => write!(f, "unsupported type {pt}"),
        }
    }
}

/// Convenience alias for `Result<T, VideoError>`.
pub type Result<T> = std::result::Result<T, VideoError>;
