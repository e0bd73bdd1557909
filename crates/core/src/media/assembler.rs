use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use slab::Slab;

use super::h264::{FU_A_HEADER_LEN, NAL_TYPE_FU_A, NAL_TYPE_IDR};
use super::rtp::RtpPacket;
use crate::access_unit::EncodedAccessUnit;
use crate::cipher::PayloadCipher;
use crate::error::{MalformedKind, Result, VideoError};
use crate::pool::BufferPool;

/// Default limit on frames assembled concurrently.
pub const DEFAULT_MAX_ASSEMBLIES: usize = 32;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Counters kept by the assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub completed: u64,
    /// Frames discarded at finalize or by eviction.
    pub dropped: u64,
    /// Packets that could not be parsed or decrypted.
    pub malformed: u64,
}

/// One frame in progress, keyed by RTP timestamp.
#[derive(Debug)]
struct Assembly {
    timestamp: u32,
    /// Annex-B output so far; every completed NAL is preceded by a start code.
    data: Vec<u8>,
    nal_count: usize,
    /// NAL type of the FU-A fragment run in progress.
    fragment_type: Option<u8>,
    last_sequence: u16,
    key_frame: bool,
    invalid: bool,
    last_used: u64,
}

impl Assembly {
    fn new(timestamp: u32, sequence: u16, tick: u64) -> Self {
        Self {
            timestamp,
            data: Vec::new(),
            nal_count: 0,
            fragment_type: None,
            last_sequence: sequence,
            key_frame: false,
            invalid: false,
            last_used: tick,
        }
    }

    fn push_nal(&mut self, nal: &[u8]) {
        self.data.extend_from_slice(&START_CODE);
        self.data.extend_from_slice(nal);
        self.nal_count += 1;
        if nal[0] & 0x1f == NAL_TYPE_IDR {
            self.key_frame = true;
        }
    }

    /// Feed one decrypted payload. Errors mark the frame invalid.
    fn push_payload(&mut self, payload: &[u8]) -> Result<()> {
        let Some(&first) = payload.first() else {
            return Err(VideoError::malformed(MalformedKind::Truncated));
        };
        let nal_type = first & 0x1f;

        match nal_type {
            1..=23 => {
                if self.fragment_type.is_some() {
                    return Err(VideoError::FragmentGap {
                        timestamp: self.timestamp,
                    });
                }
                self.push_nal(payload);
                Ok(())
            }
            NAL_TYPE_FU_A => {
                if payload.len() < FU_A_HEADER_LEN {
                    return Err(VideoError::malformed(MalformedKind::Truncated));
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let original_type = fu_header & 0x1f;
                let fragment = &payload[FU_A_HEADER_LEN..];

                if start {
                    if self.fragment_type.is_some() {
                        return Err(VideoError::FragmentGap {
                            timestamp: self.timestamp,
                        });
                    }
                    // F and NRI from the indicator, type from the FU header.
                    let nal_header = (first & 0xe0) | original_type;
                    self.data.extend_from_slice(&START_CODE);
                    self.data.push(nal_header);
                    self.fragment_type = Some(original_type);
                    if original_type == NAL_TYPE_IDR {
                        self.key_frame = true;
                    }
                } else if self.fragment_type != Some(original_type) {
                    return Err(VideoError::FragmentGap {
                        timestamp: self.timestamp,
                    });
                }

                self.data.extend_from_slice(fragment);
                if end {
                    self.fragment_type = None;
                    self.nal_count += 1;
                }
                Ok(())
            }
            other => Err(VideoError::malformed(MalformedKind::UnsupportedType(other))),
        }
    }
}

/// H.264 RTP depacketizer (RFC 6184, single NAL and FU-A).
///
/// Rebuilds Annex-B access units from RTP packets. Packets are expected in
/// sequence order (the receiver runs them through a
/// [`ReorderBuffer`](super::reorder::ReorderBuffer) first). Any sequence gap,
/// orphaned FU-A continuation, or undecodable payload poisons the frame it
/// touches: the frame is discarded when its marker packet arrives, so a
/// partial access unit is never emitted.
///
/// Frames in progress live in a slab arena indexed by timestamp. At most
/// `max_assemblies` are kept; a new timestamp beyond that evicts the least
/// recently touched one.
pub struct FrameAssembler {
    cipher: Arc<dyn PayloadCipher>,
    pool: BufferPool,
    max_assemblies: usize,
    assemblies: Slab<Assembly>,
    by_timestamp: HashMap<u32, usize>,
    tick: u64,
    /// Sequence number of the last packet processed.
    last_sequence: Option<u16>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(cipher: Arc<dyn PayloadCipher>, pool: BufferPool, max_assemblies: usize) -> Self {
        let max_assemblies = max_assemblies.max(1);
        Self {
            cipher,
            pool,
            max_assemblies,
            assemblies: Slab::with_capacity(max_assemblies),
            by_timestamp: HashMap::with_capacity(max_assemblies),
            tick: 0,
            last_sequence: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Frames currently being assembled.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Feed one RTP packet.
    ///
    /// Returns the finished access unit when this packet carries the marker
    /// bit and the frame is intact. Packet-level problems are logged and
    /// counted; only pool exhaustion is returned as an error.
    pub fn process(&mut self, packet: &RtpPacket<'_>) -> Result<Option<EncodedAccessUnit>> {
        let header = packet.header;
        let previous = self.last_sequence.replace(header.sequence);
        let key = self.entry_for(header.timestamp, header.sequence, previous);

        let mut payload = BytesMut::from(packet.payload);
        let pushed = match self.cipher.decrypt(&header.metadata(), &mut payload) {
            Ok(()) => self.assemblies[key].push_payload(&payload),
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            if matches!(e, VideoError::MalformedPacket { .. } | VideoError::Cipher(_)) {
                self.stats.malformed += 1;
            }
            let assembly = &mut self.assemblies[key];
            if !assembly.invalid {
                tracing::debug!(
                    ts = header.timestamp,
                    seq = header.sequence,
                    error = %e,
                    "frame marked invalid"
                );
            }
            assembly.invalid = true;
        }

        if !header.marker {
            return Ok(None);
        }
        self.finalize(key)
    }

    /// Locate or create the assembly for `timestamp`, flagging sequence gaps.
    fn entry_for(&mut self, timestamp: u32, sequence: u16, previous: Option<u16>) -> usize {
        self.tick += 1;
        let tick = self.tick;

        if let Some(&key) = self.by_timestamp.get(&timestamp) {
            let assembly = &mut self.assemblies[key];
            if sequence != assembly.last_sequence.wrapping_add(1) {
                tracing::debug!(
                    ts = timestamp,
                    seq = sequence,
                    last = assembly.last_sequence,
                    "sequence gap inside frame"
                );
                assembly.invalid = true;
            }
            assembly.last_sequence = sequence;
            assembly.last_used = tick;
            return key;
        }

        if self.assemblies.len() >= self.max_assemblies {
            self.evict_oldest();
        }

        let mut assembly = Assembly::new(timestamp, sequence, tick);
        // A gap right before a new frame may have swallowed its first packets.
        if let Some(last_seq) = previous
            && sequence != last_seq.wrapping_add(1)
        {
            tracing::debug!(ts = timestamp, seq = sequence, last = last_seq, "frame starts after a gap");
            assembly.invalid = true;
        }
        let key = self.assemblies.insert(assembly);
        self.by_timestamp.insert(timestamp, key);
        key
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .assemblies
            .iter()
            .min_by_key(|(_, a)| a.last_used)
            .map(|(key, _)| key);
        if let Some(key) = oldest {
            let evicted = self.assemblies.remove(key);
            self.by_timestamp.remove(&evicted.timestamp);
            self.stats.dropped += 1;
            let reason = VideoError::CapacityExceeded {
                limit: self.max_assemblies,
            };
            tracing::warn!(ts = evicted.timestamp, error = %reason, "oldest frame evicted");
        }
    }

    fn finalize(&mut self, key: usize) -> Result<Option<EncodedAccessUnit>> {
        let assembly = self.assemblies.remove(key);
        self.by_timestamp.remove(&assembly.timestamp);

        if assembly.invalid || assembly.fragment_type.is_some() || assembly.nal_count == 0 {
            self.stats.dropped += 1;
            tracing::trace!(ts = assembly.timestamp, "incomplete frame dropped");
            return Ok(None);
        }

        let mut buffer = self.pool.acquire(assembly.data.len())?;
        buffer.extend_from_slice(&assembly.data);
        let au = EncodedAccessUnit::new(buffer, assembly.key_frame, assembly.timestamp, 0)?;
        self.stats.completed += 1;
        tracing::trace!(
            ts = assembly.timestamp,
            nals = assembly.nal_count,
            bytes = au.len(),
            key_frame = au.is_key_frame(),
            "access unit assembled"
        );
        Ok(Some(au))
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("max_assemblies", &self.max_assemblies)
            .field("pending", &self.assemblies.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{NoopCipher, PacketMetadata, XorTestCipher};
    use crate::media::h264::H264Packetizer;
    use crate::media::rtp::RtpHeader;
    use crate::media::sequence::SequenceGenerator;

    fn assembler(max: usize) -> FrameAssembler {
        FrameAssembler::new(Arc::new(NoopCipher), BufferPool::new(16), max)
    }

    fn packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            marker,
            payload_type: 96,
            sequence: seq,
            timestamp: ts,
            ssrc: 1,
        };
        [&header.write()[..], payload].concat()
    }

    fn feed(asm: &mut FrameAssembler, datagram: &[u8]) -> Option<EncodedAccessUnit> {
        asm.process(&RtpPacket::parse(datagram).unwrap()).unwrap()
    }

    fn packetize(au: &EncodedAccessUnit, cipher: Arc<dyn PayloadCipher>) -> Vec<bytes::Bytes> {
        let mut p = H264Packetizer::new(96, 1, 1200, cipher)
            .unwrap()
            .with_sequence(SequenceGenerator::new(0));
        p.packetize(au).collect()
    }

    #[test]
    fn single_nal_frame() {
        let mut asm = assembler(4);
        assert!(feed(&mut asm, &packet(0, 3000, false, &[0x67, 0x42])).is_none());
        let au = feed(&mut asm, &packet(1, 3000, true, &[0x65, 0x88])).unwrap();
        assert_eq!(au.annex_b(), &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88]);
        assert!(au.is_key_frame());
        assert_eq!(au.rtp_timestamp(), 3000);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn fu_a_round_trip() {
        let pool = BufferPool::new(4);
        let mut data = vec![0, 0, 0, 1, 0x45];
        data.extend((0..5000).map(|i| (i % 251) as u8));
        let au = EncodedAccessUnit::from_annex_b(&pool, &data, true, 9000, 0).unwrap();

        let mut asm = assembler(4);
        let packets = packetize(&au, Arc::new(NoopCipher));
        assert!(packets.len() > 1);
        let mut out = None;
        for p in &packets {
            out = feed(&mut asm, p);
        }
        let out = out.unwrap();
        assert_eq!(out.annex_b(), au.annex_b());
        assert!(out.is_key_frame(), "NAL type 5 reconstructed from FU header");
    }

    #[test]
    fn decrypts_before_reassembly() {
        let pool = BufferPool::new(4);
        let mut data = vec![0, 0, 0, 1, 0x41];
        data.extend(vec![0x33; 3000]);
        let au = EncodedAccessUnit::from_annex_b(&pool, &data, false, 1, 0).unwrap();
        let cipher: Arc<dyn PayloadCipher> = Arc::new(XorTestCipher::default());

        let mut asm = FrameAssembler::new(cipher.clone(), BufferPool::new(4), 4);
        let mut out = None;
        for p in packetize(&au, cipher) {
            out = feed(&mut asm, &p);
        }
        assert_eq!(out.unwrap().annex_b(), au.annex_b());
    }

    #[test]
    fn missing_middle_fragment_drops_frame() {
        let pool = BufferPool::new(4);
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend(vec![0x11; 4000]);
        let au = EncodedAccessUnit::from_annex_b(&pool, &data, true, 1, 0).unwrap();
        let packets = packetize(&au, Arc::new(NoopCipher));
        assert!(packets.len() >= 3);

        let mut asm = assembler(4);
        for (i, p) in packets.iter().enumerate() {
            if i == 1 {
                continue;
            }
            assert!(feed(&mut asm, p).is_none());
        }
        assert_eq!(asm.stats().dropped, 1);
        assert_eq!(asm.pool().outstanding(), 0);
    }

    #[test]
    fn continuation_without_start_drops_frame() {
        let mut asm = assembler(4);
        // FU-A end fragment with no preceding start
        assert!(feed(&mut asm, &packet(5, 10, true, &[0x7c, 0x45, 1, 2])).is_none());
        assert_eq!(asm.stats().dropped, 1);
    }

    #[test]
    fn fragment_type_mismatch_drops_frame() {
        let mut asm = assembler(4);
        feed(&mut asm, &packet(0, 10, false, &[0x7c, 0x85, 1]));
        assert!(feed(&mut asm, &packet(1, 10, true, &[0x7c, 0x41, 2])).is_none());
        assert_eq!(asm.stats().dropped, 1);
    }

    #[test]
    fn malformed_payloads_counted() {
        let mut asm = assembler(4);
        assert!(feed(&mut asm, &packet(0, 10, false, &[])).is_none());
        assert!(feed(&mut asm, &packet(1, 10, false, &[0x7c])).is_none());
        assert!(feed(&mut asm, &packet(2, 10, true, &[0x78, 0, 1])).is_none());
        let stats = asm.stats();
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn frame_after_gap_is_dropped() {
        let mut asm = assembler(4);
        assert!(feed(&mut asm, &packet(0, 100, true, &[0x41, 1])).is_some());
        // seq 1 (start of the next frame) lost
        assert!(feed(&mut asm, &packet(2, 200, true, &[0x41, 2])).is_none());
        assert!(feed(&mut asm, &packet(3, 300, true, &[0x41, 3])).is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut asm = assembler(2);
        feed(&mut asm, &packet(0, 100, false, &[0x41, 1]));
        feed(&mut asm, &packet(1, 200, false, &[0x41, 2]));
        assert_eq!(asm.pending(), 2);
        feed(&mut asm, &packet(2, 300, false, &[0x41, 3]));
        assert_eq!(asm.pending(), 2);
        assert_eq!(asm.stats().dropped, 1);
        // ts 100 was evicted; its marker packet starts over
        assert!(feed(&mut asm, &packet(3, 100, true, &[0x41, 4])).is_some());
    }

    struct RejectingCipher;

    impl PayloadCipher for RejectingCipher {
        fn encrypt(&self, _meta: &PacketMetadata, _payload: &mut BytesMut) -> Result<()> {
            Ok(())
        }
        fn decrypt(&self, meta: &PacketMetadata, _payload: &mut BytesMut) -> Result<()> {
            if meta.sequence == 1 {
                return Err(VideoError::Cipher("authentication tag mismatch".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn decrypt_failure_drops_only_its_frame() {
        let mut asm = FrameAssembler::new(Arc::new(RejectingCipher), BufferPool::new(4), 4);
        assert!(feed(&mut asm, &packet(0, 10, false, &[0x67, 1])).is_none());
        assert!(feed(&mut asm, &packet(1, 10, true, &[0x65, 2])).is_none());
        assert!(feed(&mut asm, &packet(2, 20, true, &[0x41, 3])).is_some());
        let stats = asm.stats();
        assert_eq!((stats.malformed, stats.dropped, stats.completed), (1, 1, 1));
    }

    #[test]
    fn pool_exhaustion_propagates() {
        let mut asm = FrameAssembler::new(Arc::new(NoopCipher), BufferPool::new(1), 4);
        let _held = feed(&mut asm, &packet(0, 1, true, &[0x41, 1])).unwrap();
        let err = asm
            .process(&RtpPacket::parse(&packet(1, 2, true, &[0x41, 2])).unwrap())
            .unwrap_err();
        assert!(matches!(err, VideoError::PoolExhausted { limit: 1 }));
    }
}
