//! Pluggable per-packet payload protection.
//!
//! The packetizer encrypts each RTP payload in place right before the packet
//! leaves it; the assembler decrypts each payload once before fragment
//! processing. Both hand the cipher the packet's [`PacketMetadata`], which an
//! authenticated implementation may use as associated data or nonce input.
//!
//! Contract for implementors:
//!
//! - `decrypt(encrypt(x)) == x` for identical metadata, including empty `x`.
//! - `encrypt` may grow the payload by at most [`overhead`](PayloadCipher::overhead) bytes.
//! - Failures are reported as [`VideoError::Cipher`] and are scoped to the
//!   one packet.

use bytes::BytesMut;

use crate::error::Result;

/// RTP header fields visible to the cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketMetadata {
    pub timestamp: u32,
    pub sequence: u16,
    pub ssrc: u32,
    pub marker: bool,
}

/// Per-packet encrypt/decrypt capability.
pub trait PayloadCipher: Send + Sync {
    /// Transform `payload` in place. It may grow by up to [`overhead`](Self::overhead).
    fn encrypt(&self, meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()>;

    /// Invert [`encrypt`](Self::encrypt) in place.
    fn decrypt(&self, meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()>;

    /// Maximum number of bytes `encrypt` adds to a payload.
    fn overhead(&self) -> usize {
        0
    }
}

impl std::fmt::Debug for dyn PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("overhead", &self.overhead())
            .finish_non_exhaustive()
    }
}

/// Pass-through cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCipher;

impl PayloadCipher for NoopCipher {
    fn encrypt(&self, _meta: &PacketMetadata, _payload: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decrypt(&self, _meta: &PacketMetadata, _payload: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

/// Reversible XOR transform for exercising the cipher path in tests.
///
/// Provides no confidentiality whatsoever.
#[derive(Debug, Clone, Copy)]
pub struct XorTestCipher {
    key: u8,
}

impl XorTestCipher {
    pub const DEFAULT_KEY: u8 = 0x5A;

    pub fn new(key: u8) -> Self {
        Self { key }
    }

    fn apply(&self, payload: &mut BytesMut) {
        for b in payload.iter_mut() {
            *b ^= self.key;
        }
    }
}

impl Default for XorTestCipher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEY)
    }
}

impl PayloadCipher for XorTestCipher {
    fn encrypt(&self, _meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()> {
        self.apply(payload);
        Ok(())
    }

    fn decrypt(&self, _meta: &PacketMetadata, payload: &mut BytesMut) -> Result<()> {
        self.apply(payload);
        Ok(())
    }
}
