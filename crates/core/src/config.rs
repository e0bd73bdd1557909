//! Configuration for the sender, receiver and negotiated session.
//!
//! Every struct has a `Default` and derives `Deserialize` with
//! `#[serde(default)]`, so a partial JSON document fills in the rest.

use serde::Deserialize;

use crate::error::{Result, VideoError};
use crate::media::assembler::DEFAULT_MAX_ASSEMBLIES;
use crate::media::h264::{DEFAULT_MTU, DEFAULT_PAYLOAD_TYPE, FU_A_HEADER_LEN};
use crate::media::reorder::DEFAULT_REORDER_CAPACITY;
use crate::media::rtp::RTP_HEADER_LEN;
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::rtcp::payload_type_collides_with_rtcp;
use crate::rtcp::stats::{DEFAULT_WRAP_HIGH, DEFAULT_WRAP_LOW};

/// Video RTP clock rate (RFC 6184 §8.2.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

pub const DEFAULT_CODEC: &str = "H264";
/// Constrained Baseline, level 3.1.
pub const DEFAULT_PROFILE_LEVEL_ID: &str = "42e01f";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Random when `None` (RFC 3550 §8.1).
    pub ssrc: Option<u32>,
    pub payload_type: u8,
    /// Largest datagram handed to the transport, RTP header included.
    pub mtu: usize,
    pub clock_rate: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ssrc: None,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            mtu: DEFAULT_MTU,
            clock_rate: VIDEO_CLOCK_RATE,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mtu <= RTP_HEADER_LEN + FU_A_HEADER_LEN {
            return Err(VideoError::InvalidConfig(format!(
                "mtu {} leaves no room for payload",
                self.mtu
            )));
        }
        if self.clock_rate == 0 {
            return Err(VideoError::InvalidConfig("clock_rate must be nonzero".into()));
        }
        if payload_type_collides_with_rtcp(self.payload_type) {
            return Err(VideoError::InvalidConfig(format!(
                "payload type {} collides with RTCP packet types",
                self.payload_type
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub reorder_capacity: usize,
    pub max_assemblies: usize,
    pub clock_rate: u32,
    /// Access units that may be held by the application at once.
    pub pool_capacity: usize,
    /// Sequence wrap is assumed when the highest sequence so far exceeds
    /// `wrap_high` and a packet below `wrap_low` arrives.
    pub wrap_high: u16,
    pub wrap_low: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
            max_assemblies: DEFAULT_MAX_ASSEMBLIES,
            clock_rate: VIDEO_CLOCK_RATE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            wrap_high: DEFAULT_WRAP_HIGH,
            wrap_low: DEFAULT_WRAP_LOW,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reorder_capacity == 0 || self.max_assemblies == 0 || self.pool_capacity == 0 {
            return Err(VideoError::InvalidConfig(
                "reorder_capacity, max_assemblies and pool_capacity must be nonzero".into(),
            ));
        }
        if self.wrap_low >= self.wrap_high {
            return Err(VideoError::InvalidConfig(format!(
                "wrap_low {} must be below wrap_high {}",
                self.wrap_low, self.wrap_high
            )));
        }
        if self.clock_rate == 0 {
            return Err(VideoError::InvalidConfig("clock_rate must be nonzero".into()));
        }
        Ok(())
    }
}

/// Parameters advertised in a negotiation offer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VideoSessionConfig {
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub fps: u32,
    pub codec: String,
    pub profile_level_id: String,
    /// Base64 `SPS,PPS`, if known before the first frame.
    pub sprop_parameter_sets: Option<String>,
    pub low_latency: bool,
    pub mtu: usize,
}

impl Default for VideoSessionConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            fps: 30,
            codec: DEFAULT_CODEC.to_string(),
            profile_level_id: DEFAULT_PROFILE_LEVEL_ID.to_string(),
            sprop_parameter_sets: None,
            low_latency: true,
            mtu: DEFAULT_MTU,
        }
    }
}

impl VideoSessionConfig {
    /// RTP timestamp step per frame at the video clock rate.
    pub fn timestamp_increment(&self) -> u32 {
        VIDEO_CLOCK_RATE / self.fps.max(1)
    }
}
