use std::collections::HashMap;

use bytes::Bytes;

/// Default number of packets held while waiting for a gap to fill.
pub const DEFAULT_REORDER_CAPACITY: usize = 64;

/// Sequence-ordered buffer that releases packets only in contiguous runs.
///
/// The release cursor starts at the first sequence number seen. Until the
/// first release, an older packet pulls the cursor back to itself, so a
/// stream whose first two packets swap is still delivered in order. After
/// that, packets behind the cursor and duplicates are discarded.
///
/// Sequence comparison is modulo 2^16: a packet is "ahead" of the cursor when
/// `seq - cursor` (wrapping) is below 0x8000.
///
/// When the buffer is full, the packet nearest the cursor is force-released
/// into the next [`pop_ready`](Self::pop_ready) and the cursor jumps past it,
/// abandoning the gap. The assembler then sees the jump and drops the frame
/// that straddled it.
///
/// Call [`pop_ready`](Self::pop_ready) after every [`add`](Self::add). If the
/// caller falls behind, at most `capacity` force-released packets are kept
/// and the oldest of them is discarded, so the buffer never holds more than
/// twice its capacity.
#[derive(Debug)]
pub struct ReorderBuffer {
    capacity: usize,
    pending: HashMap<u16, Bytes>,
    expected: Option<u16>,
    released_any: bool,
    forced: Vec<Bytes>,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: HashMap::with_capacity(capacity),
            expected: None,
            released_any: false,
            forced: Vec::new(),
            dropped: 0,
        }
    }

    /// Offset of `seq` ahead of the cursor, or `None` if it is behind.
    fn distance(expected: u16, seq: u16) -> Option<u16> {
        let d = seq.wrapping_sub(expected);
        (d < 0x8000).then_some(d)
    }

    /// Buffer one packet keyed by its RTP sequence number.
    pub fn add(&mut self, sequence: u16, packet: Bytes) {
        let expected = *self.expected.get_or_insert(sequence);

        if Self::distance(expected, sequence).is_none() {
            if self.released_any {
                self.dropped += 1;
                tracing::trace!(seq = sequence, expected, "late packet dropped");
                return;
            }
            self.expected = Some(sequence);
        }

        if self.pending.contains_key(&sequence) {
            self.dropped += 1;
            tracing::trace!(seq = sequence, "duplicate packet dropped");
            return;
        }
        self.pending.insert(sequence, packet);

        if self.pending.len() > self.capacity {
            self.evict_nearest();
        }
    }

    fn evict_nearest(&mut self) {
        let Some(expected) = self.expected else {
            return;
        };
        let nearest = self
            .pending
            .keys()
            .copied()
            .min_by_key(|&seq| seq.wrapping_sub(expected));
        let Some(seq) = nearest else {
            return;
        };
        if let Some(packet) = self.pending.remove(&seq) {
            tracing::debug!(
                seq,
                expected,
                capacity = self.capacity,
                "reorder buffer full, skipping gap"
            );
            if self.forced.len() >= self.capacity {
                self.forced.remove(0);
                self.dropped += 1;
                tracing::trace!(
                    capacity = self.capacity,
                    "undrained released packet discarded"
                );
            }
            self.forced.push(packet);
            self.expected = Some(seq.wrapping_add(1));
            self.released_any = true;
        }
    }

    /// Drain the contiguous run starting at the cursor, plus anything forced
    /// out by overflow, in sequence order.
    pub fn pop_ready(&mut self) -> Vec<Bytes> {
        let mut ready = std::mem::take(&mut self.forced);
        let Some(mut expected) = self.expected else {
            return ready;
        };
        while let Some(packet) = self.pending.remove(&expected) {
            ready.push(packet);
            expected = expected.wrapping_add(1);
        }
        if !ready.is_empty() {
            self.released_any = true;
        }
        self.expected = Some(expected);
        ready
    }

    /// Sequence number the cursor is waiting for.
    pub fn expected(&self) -> Option<u16> {
        self.expected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Late, duplicate and undrained overflow packets discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16) -> Bytes {
        Bytes::copy_from_slice(&seq.to_be_bytes())
    }

    fn seqs(packets: &[Bytes]) -> Vec<u16> {
        packets
            .iter()
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn releases_contiguous_runs() {
        let mut buf = ReorderBuffer::new(16);
        buf.add(2, pkt(2));
        buf.add(0, pkt(0));
        assert_eq!(seqs(&buf.pop_ready()), vec![0]);

        buf.add(1, pkt(1));
        assert_eq!(seqs(&buf.pop_ready()), vec![1, 2]);

        buf.add(4, pkt(4));
        assert!(buf.pop_ready().is_empty());

        buf.add(3, pkt(3));
        assert_eq!(seqs(&buf.pop_ready()), vec![3, 4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn in_order_passthrough() {
        let mut buf = ReorderBuffer::default();
        for s in 10..20 {
            buf.add(s, pkt(s));
            assert_eq!(seqs(&buf.pop_ready()), vec![s]);
        }
    }

    #[test]
    fn late_and_duplicate_dropped() {
        let mut buf = ReorderBuffer::new(16);
        buf.add(5, pkt(5));
        assert_eq!(seqs(&buf.pop_ready()), vec![5]);
        buf.add(4, pkt(4));
        buf.add(5, pkt(5));
        buf.add(7, pkt(7));
        buf.add(7, pkt(7));
        assert!(buf.pop_ready().is_empty());
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.dropped(), 3);
    }

    #[test]
    fn wraps_across_u16_boundary() {
        let mut buf = ReorderBuffer::new(16);
        buf.add(65534, pkt(65534));
        buf.add(0, pkt(0));
        buf.add(65535, pkt(65535));
        assert_eq!(seqs(&buf.pop_ready()), vec![65534, 65535, 0]);
        assert_eq!(buf.expected(), Some(1));
    }

    #[test]
    fn overflow_skips_gap_and_stays_bounded() {
        let mut buf = ReorderBuffer::new(4);
        buf.add(0, pkt(0));
        assert_eq!(seqs(&buf.pop_ready()), vec![0]);

        // 1 never arrives
        for s in 2..=6 {
            buf.add(s, pkt(s));
            assert!(buf.len() <= 4);
        }
        assert_eq!(seqs(&buf.pop_ready()), vec![2, 3, 4, 5, 6]);
        assert!(buf.is_empty());

        buf.add(1, pkt(1));
        assert!(buf.pop_ready().is_empty(), "gap packet arrived too late");
    }

    #[test]
    fn undrained_overflow_is_capped() {
        let mut buf = ReorderBuffer::new(2);
        buf.add(0, pkt(0));
        buf.add(2, pkt(2));
        buf.add(3, pkt(3));
        buf.add(4, pkt(4));
        assert_eq!(seqs(&buf.forced), vec![0, 2]);

        buf.add(5, pkt(5));
        assert_eq!(seqs(&buf.forced), vec![2, 3]);
        assert!(buf.forced.len() + buf.len() <= 2 * buf.capacity());
        assert_eq!(buf.dropped(), 1);

        assert_eq!(seqs(&buf.pop_ready()), vec![2, 3, 4, 5]);
        assert!(buf.is_empty());
    }
}
