//! Fixed-point sample rate converters
//!
//! Three quality tiers share one phase accumulator scheme: a 32.30
//! fixed-point input position where the low [`PHASE_BITS`] bits are the
//! fractional offset between input frames. The per-output-frame increment
//! is `in_rate / out_rate` in the same format, so arbitrary rational
//! ratios work without drift beyond the 2^-30 quantization.
//!
//! Resamplers pull mono or stereo 16-bit input through an
//! [`AudioBufferProvider`] and *accumulate* into an `i32` buffer with
//! per-channel gain applied in 4.12, matching the mixer's accumulator
//! format. Nothing is overwritten: callers zero (or pre-mix) the output.

mod cubic;
mod order1;
mod sinc;

pub use cubic::CubicResampler;
pub use order1::LinearResampler;
pub use sinc::SincResampler;

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, AudioResult};
use crate::provider::AudioBufferProvider;
use crate::types::Accum;

/// Fractional bits of the phase accumulator
pub const PHASE_BITS: u32 = 30;
/// One whole input frame of phase
pub const PHASE_ONE: u64 = 1 << PHASE_BITS;
const PHASE_MASK: u64 = PHASE_ONE - 1;

/// Conversion quality, trading CPU for stopband rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Linear interpolation
    #[default]
    Low,
    /// Catmull-Rom cubic interpolation
    Medium,
    /// Windowed-sinc polyphase FIR
    High,
}

/// A sample rate converter bound to one output rate and channel count
pub trait Resampler: Send {
    /// Change the input rate of a live stream. Ratios above 2:1 in either
    /// direction are rejected.
    fn set_sample_rate(&mut self, in_rate: u32) -> AudioResult<()>;

    /// Per-channel gain in 4.12, applied while accumulating
    fn set_volume(&mut self, left: i32, right: i32);

    /// Pull input and accumulate up to `out_frames` stereo frames into
    /// `out`. Returns the number of output frames produced, short only
    /// when the provider ran dry.
    fn resample(
        &mut self,
        out: &mut [Accum],
        out_frames: usize,
        provider: &mut dyn AudioBufferProvider,
    ) -> usize;

    /// Drop interpolation history, as after a flush
    fn reset(&mut self);
}

pub fn create_resampler(
    quality: Quality,
    channels: usize,
    out_rate: u32,
) -> AudioResult<Box<dyn Resampler>> {
    if channels == 0 || channels > 2 {
        return Err(AudioError::BadValue(format!(
            "resampler supports 1 or 2 channels, got {}",
            channels
        )));
    }
    if out_rate == 0 {
        return Err(AudioError::BadValue("output rate of 0".into()));
    }
    Ok(match quality {
        Quality::Low => Box::new(LinearResampler::new(channels, out_rate)),
        Quality::Medium => Box::new(CubicResampler::new(channels, out_rate)),
        Quality::High => Box::new(SincResampler::new(channels, out_rate)),
    })
}

/// Phase bookkeeping and gain shared by all tiers
pub(crate) struct PhaseState {
    pub channels: usize,
    pub out_rate: u32,
    pub in_rate: u32,
    /// Current input position, 34.30 fixed point
    pub phase: u64,
    /// Phase advance per output frame
    pub increment: u64,
    pub vol_l: i32,
    pub vol_r: i32,
}

impl PhaseState {
    pub fn new(channels: usize, out_rate: u32) -> Self {
        Self {
            channels,
            out_rate,
            in_rate: out_rate,
            phase: 0,
            increment: PHASE_ONE,
            vol_l: crate::types::UNITY_GAIN,
            vol_r: crate::types::UNITY_GAIN,
        }
    }

    pub fn set_in_rate(&mut self, in_rate: u32) -> AudioResult<()> {
        if in_rate == 0 || in_rate > self.out_rate * 2 || in_rate * 2 < self.out_rate {
            return Err(AudioError::BadValue(format!(
                "input rate {} outside 2:1 of output rate {}",
                in_rate, self.out_rate
            )));
        }
        self.in_rate = in_rate;
        // Rounded to nearest so 1:1 is exactly PHASE_ONE
        self.increment = (((in_rate as u64) << PHASE_BITS) + (self.out_rate as u64) / 2)
            / self.out_rate as u64;
        Ok(())
    }

    pub fn frac(&self) -> u64 {
        self.phase & PHASE_MASK
    }

    /// Whole input frames the accumulated phase asks to consume
    pub fn pending_frames(&self) -> u64 {
        self.phase >> PHASE_BITS
    }

    pub fn consume_frame(&mut self) {
        self.phase -= PHASE_ONE;
    }

    pub fn advance(&mut self) {
        self.phase += self.increment;
    }

    /// Upper bound on input frames needed for `out_frames` more outputs
    pub fn input_needed(&self, out_frames: usize) -> usize {
        ((self.phase + self.increment * out_frames as u64) >> PHASE_BITS) as usize + 1
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::provider::MemoryProvider;
    use crate::types::Sample;

    /// Interleave per-channel sample generators into a provider
    pub fn provider_from_samples(samples: &[Sample], channels: usize) -> MemoryProvider {
        let bytes = bytemuck::cast_slice::<Sample, u8>(samples).to_vec();
        MemoryProvider::new(bytes, channels * 2)
    }

    pub fn dc_samples(value: Sample, frames: usize, channels: usize) -> Vec<Sample> {
        vec![value; frames * channels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_serde_names() {
        assert_eq!(serde_yaml::to_string(&Quality::High).unwrap().trim(), "high");
        let q: Quality = serde_yaml::from_str("medium").unwrap();
        assert_eq!(q, Quality::Medium);
    }

    #[test]
    fn test_unity_increment_is_exact() {
        let mut state = PhaseState::new(2, 48000);
        state.set_in_rate(48000).unwrap();
        assert_eq!(state.increment, PHASE_ONE);
    }

    #[test]
    fn test_rate_limits() {
        let mut state = PhaseState::new(2, 48000);
        assert!(state.set_in_rate(96000).is_ok());
        assert!(state.set_in_rate(96001).is_err());
        assert!(state.set_in_rate(24000).is_ok());
        assert!(state.set_in_rate(23999).is_err());
        assert!(state.set_in_rate(0).is_err());
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        assert!(create_resampler(Quality::Low, 0, 48000).is_err());
        assert!(create_resampler(Quality::Low, 3, 48000).is_err());
        assert!(create_resampler(Quality::Low, 2, 0).is_err());
    }
}
