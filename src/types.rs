//! Identifiers and exposure records shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle of one open audio stream.
///
/// Unique while the stream is open; the audio pipeline may hand the same value
/// out again once the stream is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamHandle(pub i32);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl From<i32> for StreamHandle {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Opaque handle of a physical or virtual output route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub i32);

impl DeviceId {
    /// No device. Records restored from an external dose state carry this id.
    pub const NONE: DeviceId = DeviceId(0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

impl From<i32> for DeviceId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Sample layout of the PCM handed to a MEL processor.
///
/// All formats are interleaved and little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    PcmU8,
    PcmI16,
    PcmI32,
    PcmFloat,
}

impl AudioFormat {
    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::PcmU8 => 1,
            AudioFormat::PcmI16 => 2,
            AudioFormat::PcmI32 | AudioFormat::PcmFloat => 4,
        }
    }

    /// Decode one sample to a float in [-1.0, 1.0].
    ///
    /// `bytes` must hold exactly [`bytes_per_sample`](Self::bytes_per_sample) bytes.
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            AudioFormat::PcmU8 => (bytes[0] as f32 - 128.0) / 128.0,
            AudioFormat::PcmI16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            AudioFormat::PcmI32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / 2_147_483_648.0
            }
            AudioFormat::PcmFloat => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// One momentary exposure value measured on one device.
///
/// Covers the second starting at `timestamp` (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MelRecord {
    pub device_id: DeviceId,
    pub timestamp: i64,
    /// Momentary exposure level in dBA
    pub value: f32,
}

impl MelRecord {
    pub fn new(device_id: DeviceId, timestamp: i64, value: f32) -> Self {
        Self {
            device_id,
            timestamp,
            value,
        }
    }
}

/// Aggregator entry describing the dose contributed by one exposure slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsdRecord {
    /// Start of the slot in unix seconds
    pub timestamp: i64,
    /// Length of the slot in seconds
    pub duration: i32,
    /// Dose contributed by this slot (1.0 == 100% CSD)
    pub value: f32,
    /// Average exposure level over the slot in dBA
    pub average_mel: f32,
    /// Aggregator dose immediately after this record was inserted or merged
    pub cumulative_dose: f32,
}

/// Externally visible form of a [`CsdRecord`].
///
/// This is what listeners receive and what they hand back when taking over
/// the dose bookkeeping through a reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoundDoseRecord {
    pub timestamp: i64,
    pub duration: i32,
    pub value: f32,
    pub average_mel: f32,
    pub cumulative_dose: f32,
}
