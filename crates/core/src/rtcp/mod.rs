//! RTCP Sender and Receiver Reports (RFC 3550 §6.4).
//!
//! Only the two report types the video path needs are encoded. Parsing
//! accepts either as the first packet of a compound datagram; SDES, BYE and
//! APP are recognized by [`is_rtcp`] but rejected by [`RtcpPacket::parse`].
//!
//! ## Round-trip time
//!
//! The sender stamps each SR with an NTP time. The receiver echoes the middle
//! 32 bits of it (`LSR`) together with the time it held the SR (`DLSR`, in
//! 1/65536 s). When the RR comes back:
//!
//! ```text
//! rtt = now_compact - LSR - DLSR      (wrapping, 1/65536 s)
//! ```

pub mod stats;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{MalformedKind, Result, VideoError};

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_APP: u8 = 204;

/// Sender Report with no report blocks.
pub const SENDER_REPORT_LEN: usize = 28;
/// Receiver Report with exactly one report block.
pub const RECEIVER_REPORT_LEN: usize = 32;

const RTCP_HEADER_LEN: usize = 8;
const REPORT_BLOCK_LEN: usize = 24;
/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const CUMULATIVE_LOST_MAX: i32 = 0x7f_ffff;
const CUMULATIVE_LOST_MIN: i32 = -0x80_0000;

/// 64-bit NTP wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let seconds = (since_unix.as_secs() + NTP_UNIX_OFFSET) as u32;
        let fraction = ((u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000) as u32;
        Self { seconds, fraction }
    }

    /// Middle 32 bits: low 16 of the seconds, high 16 of the fraction.
    pub fn compact(&self) -> u32 {
        ((self.seconds & 0xffff) << 16) | (self.fraction >> 16)
    }
}

/// Convert a duration to 1/65536 s units, saturating.
pub fn duration_to_compact(duration: Duration) -> u32 {
    let units = (duration.as_nanos() << 16) / 1_000_000_000;
    u32::try_from(units).unwrap_or(u32::MAX)
}

/// Round-trip time in milliseconds from an echoed report.
///
/// `None` when the peer has not seen an SR yet (`LSR` or `DLSR` zero). The
/// elapsed time since the SR wraps with the 16-bit seconds field; a DLSR
/// larger than that elapsed time (clock granularity) yields zero.
pub fn rtt_ms(now_compact: u32, last_sr: u32, delay_since_last_sr: u32) -> Option<f64> {
    if last_sr == 0 || delay_since_last_sr == 0 {
        return None;
    }
    let units = now_compact
        .wrapping_sub(last_sr)
        .saturating_sub(delay_since_last_sr);
    Some(f64::from(units) * 1000.0 / 65536.0)
}

/// Whether a datagram looks like RTCP rather than RTP (RFC 5761 §4).
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 6 == 2 && (RTCP_SR..=RTCP_APP).contains(&data[1])
}

/// RTP payload types that, with the marker bit set, [`is_rtcp`] would take
/// for RTCP.
pub fn payload_type_collides_with_rtcp(payload_type: u8) -> bool {
    (RTCP_SR & 0x7f..=RTCP_APP & 0x7f).contains(&payload_type)
}

/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|    RC   |   PT=SR=200   |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         SSRC of sender                        |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |              NTP timestamp, most significant word             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |             NTP timestamp, least significant word             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         RTP timestamp                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     sender's packet count                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      sender's octet count                     |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn write(&self) -> [u8; SENDER_REPORT_LEN] {
        let mut buf = [0u8; SENDER_REPORT_LEN];
        write_header(&mut buf, 0, RTCP_SR);
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ntp.seconds.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ntp.fraction.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        buf[24..28].copy_from_slice(&self.octet_count.to_be_bytes());
        buf
    }
}

/// One reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// SSRC of the media source being reported on.
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Signed 24-bit on the wire.
    pub cumulative_lost: i32,
    pub extended_highest_sequence: u32,
    pub jitter: u32,
    /// Compact NTP of the last SR received from the source.
    pub last_sr: u32,
    /// 1/65536 s since that SR arrived.
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn write_into(&self, buf: &mut [u8]) {
        let lost = self
            .cumulative_lost
            .clamp(CUMULATIVE_LOST_MIN, CUMULATIVE_LOST_MAX);
        let lost24 = (lost as u32) & 0x00ff_ffff;

        buf[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4..8].copy_from_slice(&((u32::from(self.fraction_lost) << 24) | lost24).to_be_bytes());
        buf[8..12].copy_from_slice(&self.extended_highest_sequence.to_be_bytes());
        buf[12..16].copy_from_slice(&self.jitter.to_be_bytes());
        buf[16..20].copy_from_slice(&self.last_sr.to_be_bytes());
        buf[20..24].copy_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }

    fn parse(buf: &[u8]) -> Self {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let loss_word = word(4);
        // sign-extend the 24-bit field
        let cumulative_lost = ((loss_word << 8) as i32) >> 8;
        Self {
            ssrc: word(0),
            fraction_lost: (loss_word >> 24) as u8,
            cumulative_lost,
            extended_highest_sequence: word(8),
            jitter: word(12),
            last_sr: word(16),
            delay_since_last_sr: word(20),
        }
    }
}

/// Receiver Report carrying at most one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub reporter_ssrc: u32,
    pub block: Option<ReportBlock>,
}

impl ReceiverReport {
    pub fn write(&self) -> Vec<u8> {
        let count = usize::from(self.block.is_some());
        let mut buf = vec![0u8; RTCP_HEADER_LEN + count * REPORT_BLOCK_LEN];
        write_header(&mut buf, count as u8, RTCP_RR);
        buf[4..8].copy_from_slice(&self.reporter_ssrc.to_be_bytes());
        if let Some(block) = &self.block {
            block.write_into(&mut buf[RTCP_HEADER_LEN..]);
        }
        buf
    }
}

/// First packet of an RTCP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
}

impl RtcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTCP_HEADER_LEN {
            return Err(VideoError::malformed(MalformedKind::Truncated));
        }
        if data[0] >> 6 != 2 {
            return Err(VideoError::malformed(MalformedKind::BadVersion));
        }
        let count = usize::from(data[0] & 0x1f);
        let packet_type = data[1];
        let length_words = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let packet_len = (length_words + 1) * 4;
        if data.len() < packet_len {
            return Err(VideoError::malformed(MalformedKind::Truncated));
        }
        let data = &data[..packet_len];
        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        match packet_type {
            RTCP_SR => {
                if packet_len < SENDER_REPORT_LEN + count * REPORT_BLOCK_LEN {
                    return Err(VideoError::malformed(MalformedKind::BadLength));
                }
                Ok(Self::SenderReport(SenderReport {
                    ssrc: word(4),
                    ntp: NtpTimestamp {
                        seconds: word(8),
                        fraction: word(12),
                    },
                    rtp_timestamp: word(16),
                    packet_count: word(20),
                    octet_count: word(24),
                }))
            }
            RTCP_RR => {
                if packet_len < RTCP_HEADER_LEN + count * REPORT_BLOCK_LEN {
                    return Err(VideoError::malformed(MalformedKind::BadLength));
                }
                let block = (count > 0).then(|| ReportBlock::parse(&data[RTCP_HEADER_LEN..]));
                Ok(Self::ReceiverReport(ReceiverReport {
                    reporter_ssrc: word(4),
                    block,
                }))
            }
            other => Err(VideoError::malformed(MalformedKind::UnsupportedType(other))),
        }
    }
}

fn write_header(buf: &mut [u8], count: u8, packet_type: u8) {
    let length_words = (buf.len() / 4 - 1) as u16;
    buf[0] = (2 << 6) | (count & 0x1f);
    buf[1] = packet_type;
    buf[2..4].copy_from_slice(&length_words.to_be_bytes());
}
