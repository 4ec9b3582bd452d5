//! Common types for Chime
//!
//! This module contains the fundamental audio types used throughout the
//! Chime audio server: PCM sample aliases, fixed-point gain, stream
//! categories, and frame geometry helpers.

use serde::{Deserialize, Serialize};

/// PCM sample type on the wire and at the hardware boundary (16-bit signed)
pub type Sample = i16;

/// Mixing accumulator type (Q19.12: 16-bit samples scaled by 4.12 gain)
pub type Accum = i32;

/// Unity gain in 4.12 fixed point
pub const UNITY_GAIN: i32 = 0x1000;

/// Maximum track gain in 4.12 fixed point (no boost above unity for clients)
pub const MAX_GAIN: i32 = 0x1000;

/// Fractional bits of the 4.12 gain format
pub const GAIN_SHIFT: u32 = 12;

/// Convert a float gain in [0.0, 1.0] to 4.12 fixed point, clamped
#[inline]
pub fn gain_from_float(v: f32) -> i32 {
    ((v.clamp(0.0, 1.0) * UNITY_GAIN as f32) + 0.5) as i32
}

/// Maximum concurrently active tracks per mixer
pub const MAX_TRACKS: usize = 32;

/// Stream category a playback track belongs to
///
/// Volume and mute are controlled per category by the server, on top of
/// the per-track volume in the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum StreamType {
    Voice = 0,
    System = 1,
    Ring = 2,
    Music = 3,
    Alarm = 4,
    Notification = 5,
}

/// Number of stream categories
pub const NUM_STREAM_TYPES: usize = 6;

impl StreamType {
    /// All stream categories in index order
    pub const ALL: [StreamType; NUM_STREAM_TYPES] = [
        StreamType::Voice,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
    ];

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }
}

/// Sample encoding of a track or hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Signed 16-bit PCM, the native mixer format
    Pcm16,
    /// Unsigned 8-bit PCM (offset binary), converted up during mixing
    Pcm8,
}

impl AudioFormat {
    /// Bytes per sample for one channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::Pcm8 => 1,
        }
    }

    /// Whether the software mixer can sum this format
    pub fn is_mixable(&self) -> bool {
        matches!(self, AudioFormat::Pcm16 | AudioFormat::Pcm8)
    }
}

/// Channel configuration of a track or hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// One frame = one sample per channel; size in bytes
#[inline]
pub fn frame_size(format: AudioFormat, layout: ChannelLayout) -> usize {
    format.bytes_per_sample() * layout.channels()
}

/// PCM geometry of a stream: everything needed to interpret raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub layout: ChannelLayout,
}

impl PcmSpec {
    pub fn new(sample_rate: u32, format: AudioFormat, layout: ChannelLayout) -> Self {
        Self { sample_rate, format, layout }
    }

    /// Bytes per frame
    pub fn frame_size(&self) -> usize {
        frame_size(self.format, self.layout)
    }

    /// Duration of `frames` at this rate, in microseconds
    pub fn frames_to_us(&self, frames: usize) -> u64 {
        (frames as u64 * 1_000_000) / self.sample_rate as u64
    }
}

/// Saturate a Q19.12 accumulator value to a 16-bit sample with rounding
///
/// Overflowed sums pin to the rails instead of wrapping.
#[inline]
pub fn clamp16(acc: Accum) -> Sample {
    let v = (acc.saturating_add(1 << (GAIN_SHIFT - 1))) >> GAIN_SHIFT;
    if v > i16::MAX as i32 {
        i16::MAX
    } else if v < i16::MIN as i32 {
        i16::MIN
    } else {
        v as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_conversion() {
        assert_eq!(gain_from_float(1.0), UNITY_GAIN);
        assert_eq!(gain_from_float(0.5), 0x800);
        assert_eq!(gain_from_float(0.0), 0);
        // out-of-range input clamps
        assert_eq!(gain_from_float(2.0), UNITY_GAIN);
        assert_eq!(gain_from_float(-1.0), 0);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(frame_size(AudioFormat::Pcm16, ChannelLayout::Stereo), 4);
        assert_eq!(frame_size(AudioFormat::Pcm16, ChannelLayout::Mono), 2);
        assert_eq!(frame_size(AudioFormat::Pcm8, ChannelLayout::Mono), 1);
    }

    #[test]
    fn test_clamp16_rails() {
        // A unity-gain full-scale sample round-trips exactly
        assert_eq!(clamp16((i16::MAX as i32) << GAIN_SHIFT), i16::MAX);
        assert_eq!(clamp16((i16::MIN as i32) << GAIN_SHIFT), i16::MIN);
        // Past the rails saturates, never wraps
        assert_eq!(clamp16(i32::MAX), i16::MAX);
        assert_eq!(clamp16(i32::MIN), i16::MIN);
    }

    #[test]
    fn test_frames_to_us() {
        let spec = PcmSpec::new(48000, AudioFormat::Pcm16, ChannelLayout::Stereo);
        assert_eq!(spec.frames_to_us(48000), 1_000_000);
        assert_eq!(spec.frames_to_us(480), 10_000);
    }
}
