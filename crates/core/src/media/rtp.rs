use crate::cipher::PacketMetadata;
use crate::error::{MalformedKind, Result, VideoError};

/// Length of the fixed RTP header with no CSRCs or extension.
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Headers written here always carry version 2 with padding, extension and
/// CSRC count zero. Parsing is more lenient: CSRC lists, a header extension
/// and padding from other senders are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Set on the last packet of an access unit (RFC 6184 §5.1).
    pub marker: bool,
    /// 7-bit payload type (RFC 3551). Dynamic types use 96–127.
    pub payload_type: u8,
    /// 16-bit wrapping sequence number.
    pub sequence: u16,
    /// 90 kHz media timestamp for video.
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize the 12-byte fixed header.
    pub fn write(&self) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = RTP_VERSION << 6;
        let second_byte: u8 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Fields handed to the payload cipher.
    pub fn metadata(&self) -> PacketMetadata {
        PacketMetadata {
            timestamp: self.timestamp,
            sequence: self.sequence,
            ssrc: self.ssrc,
            marker: self.marker,
        }
    }
}

/// Borrowed view of a parsed RTP datagram.
#[derive(Debug, Clone, Copy)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse a datagram into header and payload.
    pub fn parse(datagram: &'a [u8]) -> Result<Self> {
        if datagram.len() < RTP_HEADER_LEN {
            return Err(VideoError::malformed(MalformedKind::Truncated));
        }
        let b0 = datagram[0];
        if b0 >> 6 != RTP_VERSION {
            return Err(VideoError::malformed(MalformedKind::BadVersion));
        }
        let has_padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if datagram.len() < offset {
            return Err(VideoError::malformed(MalformedKind::Truncated));
        }
        if has_extension {
            if datagram.len() < offset + 4 {
                return Err(VideoError::malformed(MalformedKind::Truncated));
            }
            let words = u16::from_be_bytes([datagram[offset + 2], datagram[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if datagram.len() < offset {
                return Err(VideoError::malformed(MalformedKind::Truncated));
            }
        }

        let mut end = datagram.len();
        if has_padding {
            let pad = datagram[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(VideoError::malformed(MalformedKind::BadPadding));
            }
            end -= pad;
        }

        let header = RtpHeader {
            marker: datagram[1] & 0x80 != 0,
            payload_type: datagram[1] & 0x7f,
            sequence: u16::from_be_bytes([datagram[2], datagram[3]]),
            timestamp: u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
            ssrc: u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        };

        Ok(Self {
            header,
            payload: &datagram[offset..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(marker: bool) -> RtpHeader {
        RtpHeader {
            marker,
            payload_type: 96,
            sequence: 0x1234,
            timestamp: 0x0102_0304,
            ssrc: 0xAABBCCDD,
        }
    }

    #[test]
    fn version_is_2() {
        let buf = make_header(false).write();
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn marker_bit() {
        assert_eq!(make_header(false).write()[1] & 0x80, 0);
        assert_eq!(make_header(true).write()[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let buf = make_header(false).write();
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn fields_big_endian() {
        let buf = make_header(true).write();
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(&buf[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn parse_reads_written_header() {
        let mut datagram = make_header(true).write().to_vec();
        datagram.extend_from_slice(&[0x65, 1, 2]);
        let pkt = RtpPacket::parse(&datagram).unwrap();
        assert_eq!(pkt.header, make_header(true));
        assert_eq!(pkt.payload, &[0x65, 1, 2]);
    }

    #[test]
    fn parse_rejects_short_datagram() {
        let err = RtpPacket::parse(&[0x80, 96, 0, 1]).unwrap_err();
        assert!(matches!(
            err,
            VideoError::MalformedPacket { kind: MalformedKind::Truncated }
        ));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut datagram = make_header(false).write();
        datagram[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&datagram).unwrap_err(),
            VideoError::MalformedPacket { kind: MalformedKind::BadVersion }
        ));
    }

    #[test]
    fn parse_skips_csrc_and_extension() {
        let mut datagram = make_header(false).write().to_vec();
        datagram[0] = 0x80 | 0x10 | 1; // X=1, CC=1
        datagram.extend_from_slice(&[9, 9, 9, 9]); // CSRC
        datagram.extend_from_slice(&[0xBE, 0xDE, 0, 1, 7, 7, 7, 7]); // 1-word extension
        datagram.extend_from_slice(&[0x61, 0xAA]);
        let pkt = RtpPacket::parse(&datagram).unwrap();
        assert_eq!(pkt.payload, &[0x61, 0xAA]);
    }

    #[test]
    fn parse_strips_padding() {
        let mut datagram = make_header(false).write().to_vec();
        datagram[0] |= 0x20;
        datagram.extend_from_slice(&[0x61, 0xAA, 0, 0, 3]);
        let pkt = RtpPacket::parse(&datagram).unwrap();
        assert_eq!(pkt.payload, &[0x61, 0xAA]);
    }
}
