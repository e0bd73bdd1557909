use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::access_unit::EncodedAccessUnit;
use crate::cipher::PayloadCipher;
use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::events::Listeners;
use crate::media::VideoDecoder;
use crate::media::assembler::FrameAssembler;
use crate::media::reorder::ReorderBuffer;
use crate::media::rtp::RtpPacket;
use crate::pool::BufferPool;
use crate::rtcp::stats::{ReceptionStats, StreamCounters, VideoStreamStats};
use crate::rtcp::{ReceiverReport, RtcpPacket, is_rtcp};

/// Reorder buffer and assembler for one incoming stream.
struct Pipeline {
    reorder: ReorderBuffer,
    assembler: FrameAssembler,
    /// Assembler malformed count already folded into the counters.
    malformed_seen: u64,
}

/// Receiving half of a video stream.
///
/// Datagrams pushed into [`process_rtp`](Self::process_rtp) update sequence
/// and jitter statistics, pass through the reorder buffer and come out of the
/// assembler as access units. Reception statistics and the data pipeline are
/// guarded separately so an RTCP timer building receiver reports never waits
/// behind frame assembly.
pub struct RtpVideoReceiver {
    config: ReceiverConfig,
    pipeline: Mutex<Pipeline>,
    reception: Mutex<ReceptionStats>,
    counters: StreamCounters,
    /// Origin of the local arrival clock used for jitter.
    epoch: Instant,
    access_units: Listeners<EncodedAccessUnit>,
    stats_listeners: Listeners<VideoStreamStats>,
}

impl RtpVideoReceiver {
    pub fn new(config: ReceiverConfig, cipher: Arc<dyn PayloadCipher>) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(config.pool_capacity);
        let pipeline = Pipeline {
            reorder: ReorderBuffer::new(config.reorder_capacity),
            assembler: FrameAssembler::new(cipher, pool, config.max_assemblies),
            malformed_seen: 0,
        };
        tracing::debug!(
            reorder_capacity = config.reorder_capacity,
            max_assemblies = config.max_assemblies,
            pool_capacity = config.pool_capacity,
            "video receiver created"
        );
        Ok(Self {
            reception: Mutex::new(ReceptionStats::new(config.wrap_high, config.wrap_low)),
            config,
            pipeline: Mutex::new(pipeline),
            counters: StreamCounters::new(),
            epoch: Instant::now(),
            access_units: Listeners::new(),
            stats_listeners: Listeners::new(),
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Pool backing the access units this receiver produces.
    pub fn pool(&self) -> BufferPool {
        self.pipeline.lock().assembler.pool().clone()
    }

    /// SSRC of the stream being received, once a packet has arrived.
    pub fn source_ssrc(&self) -> Option<u32> {
        self.reception.lock().source_ssrc()
    }

    /// Route a datagram to [`process_rtp`](Self::process_rtp) or
    /// [`process_rtcp`](Self::process_rtcp) for sockets that multiplex both.
    /// RTP with payload types 72-76 and the marker set reads as RTCP; senders
    /// refuse those types.
    pub fn process_datagram(&self, datagram: &[u8]) -> Result<Vec<EncodedAccessUnit>> {
        if is_rtcp(datagram) {
            self.process_rtcp(datagram);
            return Ok(Vec::new());
        }
        self.process_rtp(datagram)
    }

    /// Consume one RTP datagram and return any access units it completed.
    ///
    /// Listeners registered with [`on_access_unit`](Self::on_access_unit) see
    /// each unit before it is returned. Malformed datagrams are counted and
    /// dropped; the only error is pool exhaustion.
    pub fn process_rtp(&self, datagram: &[u8]) -> Result<Vec<EncodedAccessUnit>> {
        self.counters.record_received(datagram.len());

        let packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, len = datagram.len(), "dropping malformed RTP");
                self.counters.record_malformed(1);
                return Ok(Vec::new());
            }
        };
        let header = packet.header;

        {
            let arrival = self.arrival_units();
            let mut reception = self.reception.lock();
            reception.record(header.ssrc, header.sequence, header.timestamp, arrival);
            self.counters
                .set_reception(reception.cumulative_lost(), reception.jitter());
        }

        let mut completed = Vec::new();
        let mut pipeline = self.pipeline.lock();
        pipeline
            .reorder
            .add(header.sequence, Bytes::copy_from_slice(datagram));
        let ready = pipeline.reorder.pop_ready();

        let mut outcome = Ok(());
        for raw in &ready {
            let Ok(packet) = RtpPacket::parse(raw) else {
                continue;
            };
            match pipeline.assembler.process(&packet) {
                Ok(Some(au)) => completed.push(au),
                Ok(None) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let stats = pipeline.assembler.stats();
        self.counters.set_frames_dropped(stats.dropped);
        self.counters
            .record_malformed(stats.malformed - pipeline.malformed_seen);
        pipeline.malformed_seen = stats.malformed;
        drop(pipeline);

        for au in &completed {
            self.counters.record_access_unit_received();
            self.access_units.emit(au);
        }
        outcome?;
        Ok(completed)
    }

    /// Like [`process_rtp`](Self::process_rtp), handing each completed unit
    /// to `decoder`. Returns how many were submitted.
    pub fn process_rtp_into(&self, datagram: &[u8], decoder: &dyn VideoDecoder) -> Result<usize> {
        let units = self.process_rtp(datagram)?;
        let count = units.len();
        for au in units {
            decoder.submit(au);
        }
        Ok(count)
    }

    /// Consume an RTCP datagram from the remote sender.
    ///
    /// An SR is remembered so the next receiver report can echo it.
    pub fn process_rtcp(&self, data: &[u8]) -> Option<RtcpPacket> {
        self.process_rtcp_at(data, Instant::now())
    }

    pub fn process_rtcp_at(&self, data: &[u8], arrival: Instant) -> Option<RtcpPacket> {
        let packet = match RtcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, len = data.len(), "dropping malformed RTCP");
                self.counters.record_malformed(1);
                return None;
            }
        };
        match &packet {
            RtcpPacket::SenderReport(sr) => {
                self.reception.lock().record_sender_report(sr, arrival);
                tracing::debug!(
                    ssrc = format_args!("{:#010X}", sr.ssrc),
                    packets = sr.packet_count,
                    "sender report received"
                );
                self.emit_stats();
            }
            RtcpPacket::ReceiverReport(_) => {
                tracing::trace!("ignoring RR on receiver");
            }
        }
        Some(packet)
    }

    /// Build an RR about the remote source, or `None` before its first SR.
    pub fn build_receiver_report(&self, reporter_ssrc: u32) -> Option<Bytes> {
        self.build_receiver_report_at(reporter_ssrc, Instant::now())
    }

    pub fn build_receiver_report_at(&self, reporter_ssrc: u32, now: Instant) -> Option<Bytes> {
        let block = {
            let mut reception = self.reception.lock();
            if !reception.has_sender_report() {
                return None;
            }
            reception.report_block(now)
        };
        tracing::debug!(
            source = format_args!("{:#010X}", block.ssrc),
            fraction_lost = block.fraction_lost,
            cumulative_lost = block.cumulative_lost,
            jitter = block.jitter,
            "receiver report built"
        );
        let report = ReceiverReport {
            reporter_ssrc,
            block: Some(block),
        };
        self.emit_stats();
        Some(Bytes::from(report.write()))
    }

    pub fn stats(&self) -> VideoStreamStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Called for every completed access unit, in completion order.
    pub fn on_access_unit<F>(&self, handler: F)
    where
        F: Fn(&EncodedAccessUnit) + Send + Sync + 'static,
    {
        self.access_units.subscribe(handler);
    }

    /// Called with a fresh snapshot whenever an SR is consumed or an RR built.
    pub fn on_stats<F>(&self, handler: F)
    where
        F: Fn(&VideoStreamStats) + Send + Sync + 'static,
    {
        self.stats_listeners.subscribe(handler);
    }

    /// Local time since creation in RTP clock units (wrapping).
    fn arrival_units(&self) -> u32 {
        let nanos = self.epoch.elapsed().as_nanos();
        (nanos * u128::from(self.config.clock_rate) / 1_000_000_000) as u32
    }

    fn emit_stats(&self) {
        if !self.stats_listeners.is_empty() {
            self.stats_listeners.emit(&self.counters.snapshot());
        }
    }
}

impl std::fmt::Debug for RtpVideoReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpVideoReceiver")
            .field("config", &self.config)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}
