//! Encoded access units: one complete H.264 frame in Annex-B form.

use crate::error::{Result, VideoError};
use crate::pool::{BufferPool, PooledBuffer};

/// One encoded video frame as a start-code delimited NAL sequence.
///
/// The bytes live in a [`PooledBuffer`]; [`release`](Self::release) hands
/// them back to the pool exactly once, and dropping the unit does the same.
#[derive(Debug)]
pub struct EncodedAccessUnit {
    buffer: PooledBuffer,
    is_key_frame: bool,
    rtp_timestamp: u32,
    capture_ticks: i64,
}

impl EncodedAccessUnit {
    /// Wrap an already filled pooled buffer.
    ///
    /// Fails with [`VideoError::InvalidAccessUnit`] unless the data begins
    /// with a 3- or 4-byte start code.
    pub fn new(
        buffer: PooledBuffer,
        is_key_frame: bool,
        rtp_timestamp: u32,
        capture_ticks: i64,
    ) -> Result<Self> {
        if !starts_with_start_code(&buffer) {
            return Err(VideoError::InvalidAccessUnit);
        }
        Ok(Self {
            buffer,
            is_key_frame,
            rtp_timestamp,
            capture_ticks,
        })
    }

    /// Copy Annex-B bytes into a buffer taken from `pool`.
    pub fn from_annex_b(
        pool: &BufferPool,
        annex_b: &[u8],
        is_key_frame: bool,
        rtp_timestamp: u32,
        capture_ticks: i64,
    ) -> Result<Self> {
        if !starts_with_start_code(annex_b) {
            return Err(VideoError::InvalidAccessUnit);
        }
        let mut buffer = pool.acquire(annex_b.len())?;
        buffer.extend_from_slice(annex_b);
        Self::new(buffer, is_key_frame, rtp_timestamp, capture_ticks)
    }

    /// The Annex-B bytes, or an empty slice after release.
    pub fn annex_b(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether the unit carries an IDR slice.
    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    /// 90 kHz RTP timestamp (wrapping).
    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    /// Capture clock ticks supplied by the producer, for latency measurement.
    pub fn capture_ticks(&self) -> i64 {
        self.capture_ticks
    }

    /// Return the backing buffer to its pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.buffer.release() {
            tracing::trace!(ts = self.rtp_timestamp, "access unit released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_released()
    }
}

/// Whether `data` opens with `00 00 01` or `00 00 00 01`.
pub fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_start_code() {
        let pool = BufferPool::new(4);
        let err = EncodedAccessUnit::from_annex_b(&pool, &[0x65, 1, 2], true, 0, 0).unwrap_err();
        assert!(matches!(err, VideoError::InvalidAccessUnit));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn accepts_three_and_four_byte_start_codes() {
        let pool = BufferPool::new(4);
        assert!(EncodedAccessUnit::from_annex_b(&pool, &[0, 0, 1, 0x65], true, 0, 0).is_ok());
        assert!(EncodedAccessUnit::from_annex_b(&pool, &[0, 0, 0, 1, 0x61], false, 0, 0).is_ok());
    }

    #[test]
    fn release_is_idempotent() {
        let pool = BufferPool::new(4);
        let mut au =
            EncodedAccessUnit::from_annex_b(&pool, &[0, 0, 0, 1, 0x65, 9], true, 3000, 7).unwrap();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(au.rtp_timestamp(), 3000);
        assert_eq!(au.capture_ticks(), 7);

        au.release();
        au.release();
        assert!(au.is_released());
        assert!(au.annex_b().is_empty());
        assert_eq!(pool.outstanding(), 0);
        drop(au);
        assert_eq!(pool.outstanding(), 0);
    }
}
