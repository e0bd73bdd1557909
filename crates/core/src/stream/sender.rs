use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::access_unit::EncodedAccessUnit;
use crate::cipher::PayloadCipher;
use crate::config::SenderConfig;
use crate::error::Result;
use crate::events::Listeners;
use crate::media::h264::H264Packetizer;
use crate::media::rtp::RTP_HEADER_LEN;
use crate::rtcp::stats::{StreamCounters, VideoStreamStats};
use crate::rtcp::{NtpTimestamp, RtcpPacket, SenderReport, rtt_ms};
use crate::transport::DatagramSink;

/// Sending half of a video stream.
///
/// Packetizes access units onto a [`DatagramSink`] and produces Sender
/// Reports. Every method takes `&self`: the packetizer sits behind a mutex
/// and the counters are atomic, so an RTCP timer thread can share the sender
/// through an `Arc` with the encoder thread.
pub struct RtpVideoSender {
    config: SenderConfig,
    packetizer: Mutex<H264Packetizer>,
    sink: Arc<dyn DatagramSink>,
    counters: StreamCounters,
    /// Compact NTP time of the last SR we sent.
    last_sr: Mutex<Option<u32>>,
    stats_listeners: Listeners<VideoStreamStats>,
}

impl RtpVideoSender {
    pub fn new(
        config: SenderConfig,
        cipher: Arc<dyn PayloadCipher>,
        sink: Arc<dyn DatagramSink>,
    ) -> Result<Self> {
        config.validate()?;
        let packetizer = match config.ssrc {
            Some(ssrc) => H264Packetizer::new(config.payload_type, ssrc, config.mtu, cipher)?,
            None => H264Packetizer::with_random_ssrc(config.payload_type, config.mtu, cipher)?,
        };
        tracing::debug!(
            ssrc = format_args!("{:#010X}", packetizer.ssrc()),
            pt = config.payload_type,
            mtu = config.mtu,
            "video sender created"
        );
        Ok(Self {
            config,
            packetizer: Mutex::new(packetizer),
            sink,
            counters: StreamCounters::new(),
            last_sr: Mutex::new(None),
            stats_listeners: Listeners::new(),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.lock().ssrc()
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// `profile-level-id` derived from the SPS seen so far.
    pub fn profile_level_id(&self) -> Option<String> {
        self.packetizer.lock().profile_level_id()
    }

    /// Base64 `SPS,PPS` seen so far.
    pub fn sprop_parameter_sets(&self) -> Option<String> {
        self.packetizer.lock().sprop_parameter_sets()
    }

    /// Packetize `au` and hand every packet to the sink.
    ///
    /// A sink error stops the access unit and is returned; packets already
    /// sent stay counted.
    pub fn send(&self, au: &EncodedAccessUnit) -> Result<()> {
        let mut packetizer = self.packetizer.lock();
        let mut packets = 0usize;
        for packet in packetizer.packetize(au) {
            self.sink.send(&packet)?;
            self.counters.record_sent(packet.len());
            packets += 1;
        }
        self.counters.record_access_unit_sent();
        tracing::trace!(
            ts = au.rtp_timestamp(),
            packets,
            key_frame = au.is_key_frame(),
            "access unit sent"
        );
        Ok(())
    }

    /// Build an SR stamped with the current wall clock.
    pub fn build_sender_report(&self, rtp_timestamp: u32) -> Bytes {
        self.build_sender_report_at(NtpTimestamp::now(), rtp_timestamp)
    }

    /// Build an SR stamped with `ntp`.
    pub fn build_sender_report_at(&self, ntp: NtpTimestamp, rtp_timestamp: u32) -> Bytes {
        let packets = self.counters.packets_sent();
        let payload_octets = self
            .counters
            .bytes_sent()
            .saturating_sub(packets * RTP_HEADER_LEN as u64);
        let report = SenderReport {
            ssrc: self.ssrc(),
            ntp,
            rtp_timestamp,
            packet_count: packets as u32,
            octet_count: payload_octets as u32,
        };
        *self.last_sr.lock() = Some(ntp.compact());
        tracing::debug!(
            ssrc = format_args!("{:#010X}", report.ssrc),
            packets,
            rtp_ts = rtp_timestamp,
            "sender report built"
        );
        self.emit_stats();
        Bytes::copy_from_slice(&report.write())
    }

    /// Consume an RTCP datagram from the remote receiver.
    ///
    /// Returns the new RTT estimate when the datagram is an RR about this
    /// stream that echoes one of our SRs.
    pub fn process_rtcp(&self, data: &[u8]) -> Option<f64> {
        self.process_rtcp_at(data, NtpTimestamp::now())
    }

    pub fn process_rtcp_at(&self, data: &[u8], now: NtpTimestamp) -> Option<f64> {
        let packet = match RtcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, len = data.len(), "dropping malformed RTCP");
                self.counters.record_malformed(1);
                return None;
            }
        };
        let RtcpPacket::ReceiverReport(rr) = packet else {
            tracing::trace!("ignoring non-RR RTCP on sender");
            return None;
        };
        let block = rr.block?;
        let ssrc = self.ssrc();
        if block.ssrc != ssrc {
            tracing::trace!(
                block_ssrc = format_args!("{:#010X}", block.ssrc),
                "report block for another source"
            );
            return None;
        }

        self.counters
            .set_reception(i64::from(block.cumulative_lost), f64::from(block.jitter));
        let rtt = rtt_ms(now.compact(), block.last_sr, block.delay_since_last_sr);
        if let Some(rtt) = rtt {
            self.counters.set_rtt_ms(rtt);
            tracing::debug!(rtt_ms = rtt, lost = block.cumulative_lost, "receiver report processed");
        }
        self.emit_stats();
        rtt
    }

    /// Compact NTP time of the last SR built, if any.
    pub fn last_sender_report(&self) -> Option<u32> {
        *self.last_sr.lock()
    }

    pub fn stats(&self) -> VideoStreamStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Called with a fresh snapshot whenever an SR is built or an RR consumed.
    pub fn on_stats<F>(&self, handler: F)
    where
        F: Fn(&VideoStreamStats) + Send + Sync + 'static,
    {
        self.stats_listeners.subscribe(handler);
    }

    fn emit_stats(&self) {
        if !self.stats_listeners.is_empty() {
            self.stats_listeners.emit(&self.counters.snapshot());
        }
    }
}

impl std::fmt::Debug for RtpVideoSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpVideoSender")
            .field("config", &self.config)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
