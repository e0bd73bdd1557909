//! Delivery statistics.
//!
//! [`ReceptionStats`] is the per-source bookkeeping of RFC 3550 §A.3 and
//! §A.8 that feeds a [`ReportBlock`]. [`StreamCounters`] holds the atomic
//! totals shared between the data path and an RTCP timer, and
//! [`VideoStreamStats`] is the plain snapshot handed to callers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use super::{ReportBlock, SenderReport, duration_to_compact};

/// Previous highest sequence above this may wrap.
pub const DEFAULT_WRAP_HIGH: u16 = 60_000;
/// Current sequence below this after a high one counts as a wrap.
pub const DEFAULT_WRAP_LOW: u16 = 5_000;

// ─── Reception ──────────────────────────────────────────────────────────────

/// Sequence, loss and jitter tracking for one media source.
#[derive(Debug, Clone)]
pub struct ReceptionStats {
    wrap_high: u16,
    wrap_low: u16,
    source_ssrc: Option<u32>,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    /// RTP clock units, kept fractional between updates.
    jitter: f64,
    last_transit: Option<i64>,
    last_sr: Option<(u32, Instant)>,
}

impl ReceptionStats {
    pub fn new(wrap_high: u16, wrap_low: u16) -> Self {
        Self {
            wrap_high,
            wrap_low,
            source_ssrc: None,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr: None,
        }
    }

    /// Record one arriving RTP packet.
    ///
    /// `arrival` is the local receive time expressed in the same RTP clock
    /// units as `rtp_timestamp`.
    pub fn record(&mut self, ssrc: u32, sequence: u16, rtp_timestamp: u32, arrival: u32) {
        if self.source_ssrc.is_none() {
            self.source_ssrc = Some(ssrc);
            self.base_seq = sequence;
            self.max_seq = sequence;
            tracing::debug!(
                ssrc = format_args!("{:#010X}", ssrc),
                seq = sequence,
                "reception stats started"
            );
        } else {
            // only packets ahead of the highest (mod 2^16) move it
            let delta = sequence.wrapping_sub(self.max_seq);
            if delta != 0 && delta < 0x8000 {
                if sequence > self.max_seq {
                    self.max_seq = sequence;
                } else if self.max_seq > self.wrap_high && sequence < self.wrap_low {
                    self.cycles += 1;
                    self.max_seq = sequence;
                    tracing::trace!(cycles = self.cycles, "sequence wrapped");
                } else {
                    tracing::trace!(
                        seq = sequence,
                        max = self.max_seq,
                        "wrap outside thresholds ignored"
                    );
                }
            }
        }
        self.received += 1;

        // RFC 3550 §A.8
        let transit = i64::from(arrival.wrapping_sub(rtp_timestamp) as i32);
        if let Some(prev) = self.last_transit {
            let d = (transit - prev).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Remember an SR from the source for the LSR/DLSR echo.
    pub fn record_sender_report(&mut self, sr: &SenderReport, arrival: Instant) {
        self.last_sr = Some((sr.ntp.compact(), arrival));
    }

    pub fn has_sender_report(&self) -> bool {
        self.last_sr.is_some()
    }

    pub fn source_ssrc(&self) -> Option<u32> {
        self.source_ssrc
    }

    pub fn extended_highest_sequence(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    pub fn expected(&self) -> u64 {
        if self.source_ssrc.is_none() {
            return 0;
        }
        u64::from(self.extended_highest_sequence()) + 1 - u64::from(self.base_seq)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Expected minus received. Negative when duplicates arrived.
    pub fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Build a report block and start a new reporting interval.
    pub fn report_block(&mut self, now: Instant) -> ReportBlock {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval as u64 * 256) / expected_interval).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((compact, at)) => (compact, duration_to_compact(now.saturating_duration_since(at))),
            None => (0, 0),
        };

        ReportBlock {
            ssrc: self.source_ssrc.unwrap_or(0),
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(-0x80_0000, 0x7f_ffff) as i32,
            extended_highest_sequence: self.extended_highest_sequence(),
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }
}

impl Default for ReceptionStats {
    fn default() -> Self {
        Self::new(DEFAULT_WRAP_HIGH, DEFAULT_WRAP_LOW)
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Point-in-time view of a stream's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoStreamStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    /// Interarrival jitter in RTP clock units.
    pub jitter: f64,
    pub rtt_estimate_ms: Option<f64>,
    pub access_units_sent: u64,
    pub access_units_received: u64,
    pub frames_dropped: u64,
    pub malformed_packets: u64,
}

impl fmt::Display for VideoStreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={}({}B) recv={}({}B) lost={} jitter={:.2} rtt=",
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.packets_lost,
            self.jitter
        )?;
        match self.rtt_estimate_ms {
            Some(rtt) => write!(f, "{rtt:.1}ms"),
            None => f.write_str("-ms"),
        }
    }
}

// ─── Shared counters ────────────────────────────────────────────────────────

const NO_RTT: u64 = u64::MAX;

/// Lock-free counters behind [`VideoStreamStats`].
///
/// Writers on the data path and a reader on an RTCP timer may run on
/// different threads. Floating-point values are stored as their bit patterns.
#[derive(Debug)]
pub struct StreamCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
    jitter_bits: AtomicU64,
    rtt_bits: AtomicU64,
    access_units_sent: AtomicU64,
    access_units_received: AtomicU64,
    frames_dropped: AtomicU64,
    malformed_packets: AtomicU64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            jitter_bits: AtomicU64::new(0f64.to_bits()),
            rtt_bits: AtomicU64::new(NO_RTT),
            access_units_sent: AtomicU64::new(0),
            access_units_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_access_unit_sent(&self) {
        self.access_units_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_access_unit_received(&self) {
        self.access_units_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self, count: u64) {
        self.malformed_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_frames_dropped(&self, dropped: u64) {
        self.frames_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn set_reception(&self, lost: i64, jitter: f64) {
        self.packets_lost.store(lost.max(0) as u64, Ordering::Relaxed);
        self.jitter_bits.store(jitter.to_bits(), Ordering::Relaxed);
    }

    pub fn set_rtt_ms(&self, rtt_ms: f64) {
        self.rtt_bits.store(rtt_ms.to_bits(), Ordering::Relaxed);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> VideoStreamStats {
        let rtt = self.rtt_bits.load(Ordering::Relaxed);
        VideoStreamStats {
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            jitter: f64::from_bits(self.jitter_bits.load(Ordering::Relaxed)),
            rtt_estimate_ms: (rtt != NO_RTT).then(|| f64::from_bits(rtt)),
            access_units_sent: self.access_units_sent.load(Ordering::Relaxed),
            access_units_received: self.access_units_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and forget the RTT estimate.
    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.bytes_sent,
            &self.packets_received,
            &self.bytes_received,
            &self.packets_lost,
            &self.access_units_sent,
            &self.access_units_received,
            &self.frames_dropped,
            &self.malformed_packets,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.jitter_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.rtt_bits.store(NO_RTT, Ordering::Relaxed);
    }
}

impl Default for StreamCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::NtpTimestamp;
    use std::time::Duration;

    #[test]
    fn counts_loss_from_gaps() {
        let mut stats = ReceptionStats::default();
        for seq in [10u16, 11, 13, 14, 17] {
            stats.record(1, seq, 0, 0);
        }
        assert_eq!(stats.expected(), 8);
        assert_eq!(stats.received(), 5);
        assert_eq!(stats.cumulative_lost(), 3);

        let block = stats.report_block(Instant::now());
        assert_eq!(block.ssrc, 1);
        assert_eq!(block.cumulative_lost, 3);
        assert_eq!(block.fraction_lost, (3 * 256 / 8) as u8);
        assert_eq!(block.extended_highest_sequence, 17);
    }

    #[test]
    fn fraction_lost_is_per_interval() {
        let mut stats = ReceptionStats::default();
        for seq in 0u16..4 {
            stats.record(1, seq, 0, 0);
        }
        stats.record(1, 7, 0, 0); // 3 lost
        assert_eq!(stats.report_block(Instant::now()).fraction_lost, 96);

        for seq in 8u16..16 {
            stats.record(1, seq, 0, 0);
        }
        let block = stats.report_block(Instant::now());
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.cumulative_lost, 3);
    }

    #[test]
    fn duplicates_never_report_negative_fraction() {
        let mut stats = ReceptionStats::default();
        for seq in [0u16, 1, 1, 2] {
            stats.record(1, seq, 0, 0);
        }
        let block = stats.report_block(Instant::now());
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.cumulative_lost, -1);
    }

    #[test]
    fn sequence_wrap_extends_highest() {
        let mut stats = ReceptionStats::default();
        stats.record(1, 65534, 0, 0);
        stats.record(1, 65535, 0, 0);
        stats.record(1, 0, 0, 0);
        stats.record(1, 1, 0, 0);
        assert_eq!(stats.extended_highest_sequence(), (1 << 16) | 1);
        assert_eq!(stats.expected(), 4);
        assert_eq!(stats.cumulative_lost(), 0);
    }

    #[test]
    fn reordered_across_wrap_counts_no_loss() {
        let mut stats = ReceptionStats::default();
        for seq in [65534u16, 0, 65535, 1] {
            stats.record(1, seq, 0, 0);
        }
        assert_eq!(stats.extended_highest_sequence(), (1 << 16) | 1);
        assert_eq!(stats.expected(), 4);
        assert_eq!(stats.cumulative_lost(), 0);
    }

    #[test]
    fn late_packet_never_lowers_highest() {
        let mut stats = ReceptionStats::default();
        for seq in [100u16, 104, 101] {
            stats.record(1, seq, 0, 0);
        }
        assert_eq!(stats.extended_highest_sequence(), 104);
        assert_eq!(stats.cumulative_lost(), 2);
    }

    #[test]
    fn custom_wrap_thresholds() {
        let mut stats = ReceptionStats::new(65_000, 100);
        stats.record(1, 65_200, 0, 0);
        stats.record(1, 50, 0, 0);
        assert_eq!(stats.extended_highest_sequence(), (1 << 16) | 50);

        // ahead mod 2^16 but above wrap_low: not a wrap
        let mut stats = ReceptionStats::new(65_000, 100);
        stats.record(1, 65_200, 0, 0);
        stats.record(1, 200, 0, 0);
        assert_eq!(stats.extended_highest_sequence(), 65_200);
    }

    #[test]
    fn jitter_ema() {
        let mut stats = ReceptionStats::default();
        stats.record(1, 0, 0, 1000);
        assert_eq!(stats.jitter(), 0.0);
        // transit grows by 160
        stats.record(1, 1, 3000, 4160);
        assert!((stats.jitter() - 10.0).abs() < 1e-9);
        // constant transit decays the estimate
        stats.record(1, 2, 6000, 7160);
        assert!((stats.jitter() - 9.375).abs() < 1e-9);
    }

    #[test]
    fn echoes_last_sender_report() {
        let mut stats = ReceptionStats::default();
        stats.record(9, 0, 0, 0);
        assert!(!stats.has_sender_report());

        let sr = SenderReport {
            ssrc: 9,
            ntp: NtpTimestamp {
                seconds: 0x0000_0002,
                fraction: 0x4000_0000,
            },
            rtp_timestamp: 0,
            packet_count: 1,
            octet_count: 100,
        };
        let arrived = Instant::now();
        stats.record_sender_report(&sr, arrived);
        let block = stats.report_block(arrived + Duration::from_millis(500));
        assert_eq!(block.last_sr, 0x0002_4000);
        assert_eq!(block.delay_since_last_sr, 32768);
    }

    #[test]
    fn counters_snapshot_and_reset() {
        let counters = StreamCounters::new();
        counters.record_sent(1200);
        counters.record_sent(300);
        counters.record_received(50);
        counters.set_reception(-2, 4.5);
        assert_eq!(counters.snapshot().rtt_estimate_ms, None);
        counters.set_rtt_ms(12.25);

        let snap = counters.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 1500);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.packets_lost, 0);
        assert_eq!(snap.jitter, 4.5);
        assert_eq!(snap.rtt_estimate_ms, Some(12.25));

        counters.reset();
        assert_eq!(counters.snapshot(), VideoStreamStats::default());
    }

    #[test]
    fn display_format() {
        let stats = VideoStreamStats {
            packets_sent: 10,
            bytes_sent: 12000,
            packets_received: 9,
            bytes_received: 10800,
            packets_lost: 1,
            jitter: 3.14159,
            rtt_estimate_ms: Some(20.04),
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "sent=10(12000B) recv=9(10800B) lost=1 jitter=3.14 rtt=20.0ms"
        );
        let no_rtt = VideoStreamStats::default();
        assert!(no_rtt.to_string().ends_with("rtt=-ms"));
    }
}
