use std::sync::Arc;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};

use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::sequence::SequenceGenerator;
use crate::access_unit::EncodedAccessUnit;
use crate::cipher::PayloadCipher;
use crate::error::{Result, VideoError};
use crate::rtcp::payload_type_collides_with_rtcp;

pub const DEFAULT_MTU: usize = 1200;
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// NAL unit type of an IDR slice.
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
/// RFC 6184 fragmentation unit, mode A.
pub const NAL_TYPE_FU_A: u8 = 28;

/// FU indicator + FU header.
pub const FU_A_HEADER_LEN: usize = 2;

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// Converts Annex B access units into RTP packets using two modes:
///
/// - **Single NAL Unit** (§5.6): a NAL that fits in one packet is sent
///   as-is after the 12-byte header.
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split. Each fragment
///   carries a 2-byte FU header before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 14 bytes)
///   ```
///
/// The marker bit is set only on the very last packet of the access unit.
/// Sequence numbers advance once per packet. Every payload passes through
/// the configured [`PayloadCipher`] before it is yielded; when the cipher
/// declares an overhead, the size budgets above shrink by that amount so the
/// encrypted packet still fits the MTU.
///
/// SPS/PPS are captured from the first access unit that contains them, so
/// negotiation can advertise `profile-level-id` and `sprop-parameter-sets`.
pub struct H264Packetizer {
    payload_type: u8,
    ssrc: u32,
    mtu: usize,
    sequence: SequenceGenerator,
    cipher: Arc<dyn PayloadCipher>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type, SSRC and MTU.
    ///
    /// Fails if the MTU leaves no room for an FU-A fragment.
    pub fn new(
        payload_type: u8,
        ssrc: u32,
        mtu: usize,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Self> {
        let min_mtu = RTP_HEADER_LEN + FU_A_HEADER_LEN + cipher.overhead();
        if mtu <= min_mtu {
            return Err(VideoError::InvalidConfig(format!(
                "mtu {mtu} must exceed {min_mtu}"
            )));
        }
        if payload_type > 0x7f {
            return Err(VideoError::InvalidConfig(format!(
                "payload type {payload_type} does not fit in 7 bits"
            )));
        }
        if payload_type_collides_with_rtcp(payload_type) {
            return Err(VideoError::InvalidConfig(format!(
                "payload type {payload_type} collides with RTCP packet types"
            )));
        }
        tracing::debug!(
            pt = payload_type,
            ssrc = format_args!("{:#010X}", ssrc),
            mtu,
            "H.264 packetizer created"
        );
        Ok(Self {
            payload_type,
            ssrc,
            mtu,
            sequence: SequenceGenerator::with_random_start(),
            cipher,
            sps: None,
            pps: None,
        })
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(
        payload_type: u8,
        mtu: usize,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Self> {
        Self::new(payload_type, rand::random::<u32>(), mtu, cipher)
    }

    /// Replace the sequence generator (e.g. to pin the starting number).
    pub fn with_sequence(mut self, sequence: SequenceGenerator) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence.peek()
    }

    /// Largest NAL sent as a single packet.
    fn max_single_nal(&self) -> usize {
        self.mtu - RTP_HEADER_LEN - self.cipher.overhead()
    }

    /// Largest FU-A fragment body.
    fn max_fragment(&self) -> usize {
        self.mtu - RTP_HEADER_LEN - FU_A_HEADER_LEN - self.cipher.overhead()
    }

    /// Derive profile-level-id from SPS (RFC 6184 §8.1): bytes 1–3 are
    /// profile_idc, constraint flags and level_idc.
    pub fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    /// Base64 `SPS,PPS` for the `sprop-parameter-sets` parameter.
    pub fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    /// Lazily packetize one access unit.
    ///
    /// The returned iterator borrows the NAL bytes straight from `au`; each
    /// packet is allocated only when the iterator is advanced.
    pub fn packetize<'a>(&'a mut self, au: &'a EncodedAccessUnit) -> Packets<'a> {
        let nals = nal_units(au.annex_b());

        if self.sps.is_none() || self.pps.is_none() {
            for nal in &nals {
                let nal_type = nal[0] & 0x1f;
                if nal_type == NAL_TYPE_SPS && self.sps.is_none() {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!("H.264 SPS captured from bitstream ({} bytes)", nal.len());
                } else if nal_type == NAL_TYPE_PPS && self.pps.is_none() {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!("H.264 PPS captured from bitstream ({} bytes)", nal.len());
                }
            }
        }

        tracing::trace!(
            nal_count = nals.len(),
            frame_bytes = au.len(),
            ts = au.rtp_timestamp(),
            seq = self.sequence.peek(),
            "packetizing access unit"
        );

        Packets {
            timestamp: au.rtp_timestamp(),
            packetizer: self,
            nals,
            nal_index: 0,
            fragment_offset: 0,
        }
    }

    /// Build one packet, running the payload through the cipher.
    ///
    /// Returns `None` if the cipher fails or overshoots its declared
    /// overhead; the sequence number is consumed either way so the receiver
    /// sees the gap.
    fn emit(&mut self, marker: bool, timestamp: u32, prefix: &[u8], body: &[u8]) -> Option<Bytes> {
        let header = RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence: self.sequence.next(),
            timestamp,
            ssrc: self.ssrc,
        };
        let plain_len = prefix.len() + body.len();
        let overhead = self.cipher.overhead();

        let mut packet = BytesMut::with_capacity(RTP_HEADER_LEN + plain_len + overhead);
        packet.extend_from_slice(&header.write());
        let mut payload = packet.split_off(RTP_HEADER_LEN);
        payload.extend_from_slice(prefix);
        payload.extend_from_slice(body);

        if let Err(e) = self.cipher.encrypt(&header.metadata(), &mut payload) {
            tracing::warn!(seq = header.sequence, error = %e, "payload encryption failed, packet skipped");
            return None;
        }
        if payload.len() > plain_len + overhead {
            tracing::warn!(
                seq = header.sequence,
                len = payload.len(),
                limit = plain_len + overhead,
                "cipher exceeded declared overhead, packet skipped"
            );
            return None;
        }

        packet.unsplit(payload);
        Some(packet.freeze())
    }
}

/// Lazy, single-pass packet sequence for one access unit.
pub struct Packets<'a> {
    packetizer: &'a mut H264Packetizer,
    timestamp: u32,
    nals: Vec<&'a [u8]>,
    nal_index: usize,
    /// Offset into the current NAL's body (after its header byte) while
    /// FU-A fragmenting.
    fragment_offset: usize,
}

impl Iterator for Packets<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        while let Some(&nal) = self.nals.get(self.nal_index) {
            let is_last_nal = self.nal_index + 1 == self.nals.len();

            if nal.len() <= self.packetizer.max_single_nal() {
                // Single NAL Unit mode (RFC 6184 §5.6)
                self.nal_index += 1;
                if let Some(packet) = self.packetizer.emit(is_last_nal, self.timestamp, &[], nal) {
                    return Some(packet);
                }
                continue;
            }

            // FU-A fragmentation (RFC 6184 §5.8)
            let nal_header = nal[0];
            let fu_indicator = (nal_header & 0xe0) | NAL_TYPE_FU_A;
            let body = &nal[1..];

            let offset = self.fragment_offset;
            let chunk_size = self.packetizer.max_fragment().min(body.len() - offset);
            let first = offset == 0;
            let last_fragment = offset + chunk_size == body.len();

            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | (nal_header & 0x1f);

            if last_fragment {
                self.nal_index += 1;
                self.fragment_offset = 0;
                tracing::trace!(
                    nal_type = nal_header & 0x1f,
                    nal_size = nal.len(),
                    "FU-A fragmented NAL unit"
                );
            } else {
                self.fragment_offset += chunk_size;
            }

            let chunk = &body[offset..offset + chunk_size];
            let marker = is_last_nal && last_fragment;
            if let Some(packet) =
                self.packetizer
                    .emit(marker, self.timestamp, &[fu_indicator, fu_header], chunk)
            {
                return Some(packet);
            }
        }
        None
    }
}

/// Split an H.264 Annex B bitstream into NAL units.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte `00 00 01`)
/// and returns the NAL data between them as slices of `data`, excluding the
/// start codes. Bytes before the first start code and empty NALs are
/// skipped.
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(&data[start..end]);
        }
    }
    nal_units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{NoopCipher, PacketMetadata, XorTestCipher};
    use crate::pool::BufferPool;

    fn make_packetizer(mtu: usize) -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD, mtu, Arc::new(NoopCipher))
            .unwrap()
            .with_sequence(SequenceGenerator::new(100))
    }

    fn single_nal_au(pool: &BufferPool, nal: &[u8]) -> EncodedAccessUnit {
        let data = [&[0u8, 0, 0, 1][..], nal].concat();
        EncodedAccessUnit::from_annex_b(pool, &data, nal[0] & 0x1f == NAL_TYPE_IDR, 9000, 0)
            .unwrap()
    }

    fn marker(packet: &[u8]) -> bool {
        packet[1] & 0x80 != 0
    }

    fn seq(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        assert_eq!(nal_units(&data), vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        assert_eq!(nal_units(&data), vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        assert_eq!(nal_units(&data), vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn extract_skips_empty_nal() {
        let data = [0, 0, 0, 1, 0, 0, 0, 1, 0x61, 0x01];
        assert_eq!(nal_units(&data), vec![&[0x61, 0x01][..]]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(nal_units(&[0xFF, 0xFE]).is_empty());
        assert!(nal_units(&[]).is_empty());
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let pool = BufferPool::new(4);
        let au = single_nal_au(&pool, &[0x65, 0xAA, 0xBB, 0xCC]);
        let mut p = make_packetizer(DEFAULT_MTU);
        let packets: Vec<_> = p.packetize(&au).collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert!(marker(&packets[0]));
        assert_eq!(&packets[0][4..8], &9000u32.to_be_bytes());
    }

    #[test]
    fn mtu_boundary_decides_fragmentation() {
        let pool = BufferPool::new(4);
        let mtu = 200;

        let mut fits = vec![0x61];
        fits.resize(mtu - RTP_HEADER_LEN, 0x11);
        let au = single_nal_au(&pool, &fits);
        assert_eq!(make_packetizer(mtu).packetize(&au).count(), 1);

        let mut too_big = vec![0x61];
        too_big.resize(mtu - RTP_HEADER_LEN + 1, 0x11);
        let au = single_nal_au(&pool, &too_big);
        let packets: Vec<_> = make_packetizer(mtu).packetize(&au).collect();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= mtu));
    }

    #[test]
    fn large_nal_fragmented() {
        let pool = BufferPool::new(4);
        let mut nal = vec![0x65];
        nal.extend(vec![0xAA; DEFAULT_MTU + 500]);
        let au = single_nal_au(&pool, &nal);
        let mut p = make_packetizer(DEFAULT_MTU);
        let packets: Vec<_> = p.packetize(&au).collect();
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0][12], 0x60 | NAL_TYPE_FU_A); // NRI kept, type 28
        assert_eq!(packets[0][13], 0x80 | NAL_TYPE_IDR); // S bit
        assert!(!marker(&packets[0]));
        assert_eq!(packets[0].len(), DEFAULT_MTU);

        let last = packets.last().unwrap();
        assert_eq!(last[13], 0x40 | NAL_TYPE_IDR); // E bit
        assert!(marker(last));

        let body: usize = packets.iter().map(|p| p.len() - 14).sum();
        assert_eq!(body, nal.len() - 1);
    }

    #[test]
    fn marker_only_on_final_packet_of_access_unit() {
        let pool = BufferPool::new(4);
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        data.extend(vec![0x5A; 3000]);
        let au = EncodedAccessUnit::from_annex_b(&pool, &data, true, 0, 0).unwrap();

        let packets: Vec<_> = make_packetizer(DEFAULT_MTU).packetize(&au).collect();
        let markers: Vec<bool> = packets.iter().map(|p| marker(p)).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(*markers.last().unwrap());
    }

    #[test]
    fn sequence_advances_per_packet_and_wraps() {
        let pool = BufferPool::new(4);
        let mut nal = vec![0x41];
        nal.extend(vec![0x01; 3 * DEFAULT_MTU]);
        let au = single_nal_au(&pool, &nal);
        let mut p = H264Packetizer::new(96, 1, DEFAULT_MTU, Arc::new(NoopCipher))
            .unwrap()
            .with_sequence(SequenceGenerator::new(u16::MAX - 1));
        let seqs: Vec<u16> = p.packetize(&au).map(|pkt| seq(&pkt)).collect();
        assert_eq!(seqs, vec![u16::MAX - 1, u16::MAX, 0, 1]);
        assert_eq!(p.next_sequence(), 2);
    }

    #[test]
    fn packetize_is_lazy() {
        let pool = BufferPool::new(4);
        let mut nal = vec![0x41];
        nal.extend(vec![0x01; 3 * DEFAULT_MTU]);
        let au = single_nal_au(&pool, &nal);
        let mut p = make_packetizer(DEFAULT_MTU);
        let first = p.packetize(&au).next();
        assert!(first.is_some());
        assert_eq!(p.next_sequence(), 101, "only one packet was produced");
    }

    #[test]
    fn cipher_applied_to_payload_only() {
        let pool = BufferPool::new(4);
        let au = single_nal_au(&pool, &[0x65, 1, 2, 3]);
        let cipher = XorTestCipher::new(0xFF);
        let mut p = H264Packetizer::new(96, 7, DEFAULT_MTU, Arc::new(cipher)).unwrap();
        let pkt = p.packetize(&au).next().unwrap();
        assert_eq!(pkt[0], 0x80);
        assert_eq!(&pkt[12..], &[0x9A, 0xFE, 0xFD, 0xFC]);
    }

    struct PaddingCipher;

    impl PayloadCipher for PaddingCipher {
        fn encrypt(&self, _meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()> {
            payload.extend_from_slice(&[0xEE; 8]);
            Ok(())
        }
        fn decrypt(&self, _meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()> {
            let len = payload.len().saturating_sub(8);
            payload.truncate(len);
            Ok(())
        }
        fn overhead(&self) -> usize {
            8
        }
    }

    #[test]
    fn cipher_overhead_shrinks_budget() {
        let pool = BufferPool::new(4);
        let mut nal = vec![0x61];
        nal.resize(DEFAULT_MTU - RTP_HEADER_LEN, 0x22);
        let au = single_nal_au(&pool, &nal);
        let mut p = H264Packetizer::new(96, 7, DEFAULT_MTU, Arc::new(PaddingCipher)).unwrap();
        let packets: Vec<_> = p.packetize(&au).collect();
        assert_eq!(packets.len(), 2, "overhead pushes the NAL into FU-A");
        assert!(packets.iter().all(|pkt| pkt.len() <= DEFAULT_MTU));
    }

    #[test]
    fn tiny_mtu_rejected() {
        assert!(matches!(
            H264Packetizer::new(96, 1, 14, Arc::new(NoopCipher)),
            Err(VideoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rtcp_colliding_payload_types_rejected() {
        for pt in 72..=76 {
            assert!(matches!(
                H264Packetizer::new(pt, 1, 1200, Arc::new(NoopCipher)),
                Err(VideoError::InvalidConfig(_))
            ));
        }
        assert!(H264Packetizer::new(71, 1, 1200, Arc::new(NoopCipher)).is_ok());
    }

    #[test]
    fn auto_capture_sps_pps_from_first_frame() {
        let pool = BufferPool::new(4);
        let sps_nal = [0x67, 0x42, 0x00, 0x1e];
        let pps_nal = [0x68, 0xce, 0x38, 0x80];
        let frame = [
            &[0u8, 0, 0, 1][..],
            &sps_nal[..],
            &[0, 0, 0, 1][..],
            &pps_nal[..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x00][..],
        ]
        .concat();
        let au = EncodedAccessUnit::from_annex_b(&pool, &frame, true, 0, 0).unwrap();
        let mut p = make_packetizer(DEFAULT_MTU);
        assert!(p.sprop_parameter_sets().is_none());
        p.packetize(&au).for_each(drop);

        assert_eq!(p.profile_level_id().as_deref(), Some("42001e"));
        assert_eq!(
            p.sprop_parameter_sets().as_deref(),
            Some("Z0IAHg==,aM44gA==")
        );
    }
}
