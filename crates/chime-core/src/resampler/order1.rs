//! Linear interpolation resampler (low quality tier)
//!
//! Two frames of history and a 15-bit interpolation factor. Aliases
//! audibly on downsampling but costs almost nothing, which is why it is
//! the default for voice-rate content.

use crate::error::AudioResult;
use crate::provider::AudioBufferProvider;
use crate::resampler::{PhaseState, Resampler, PHASE_BITS, PHASE_ONE};
use crate::types::{Accum, Sample};

pub struct LinearResampler {
    state: PhaseState,
    x0: [i32; 2],
    x1: [i32; 2],
}

impl LinearResampler {
    pub fn new(channels: usize, out_rate: u32) -> Self {
        let mut r = Self {
            state: PhaseState::new(channels, out_rate),
            x0: [0; 2],
            x1: [0; 2],
        };
        r.reset();
        r
    }
}

#[inline]
fn interp(x0: i32, x1: i32, frac15: i32) -> i32 {
    x0 + (((x1 - x0) * frac15) >> 15)
}

impl Resampler for LinearResampler {
    fn set_sample_rate(&mut self, in_rate: u32) -> AudioResult<()> {
        self.state.set_in_rate(in_rate)
    }

    fn set_volume(&mut self, left: i32, right: i32) {
        self.state.vol_l = left;
        self.state.vol_r = right;
    }

    fn resample(
        &mut self,
        out: &mut [Accum],
        out_frames: usize,
        provider: &mut dyn AudioBufferProvider,
    ) -> usize {
        let channels = self.state.channels;
        let mut produced = 0;
        'refill: while produced < out_frames {
            let needed = self.state.input_needed(out_frames - produced);
            let consumed = {
                let Some(buf) = provider.get_next_buffer(needed) else {
                    break 'refill;
                };
                let input: &[Sample] = bytemuck::cast_slice(buf);
                let in_frames = input.len() / channels;
                let mut in_idx = 0;
                loop {
                    if self.state.pending_frames() > 0 {
                        if in_idx == in_frames {
                            break; // buffer drained, fetch the next one
                        }
                        self.x0 = self.x1;
                        for (c, x) in self.x1.iter_mut().enumerate().take(channels) {
                            *x = input[in_idx * channels + c] as i32;
                        }
                        in_idx += 1;
                        self.state.consume_frame();
                        continue;
                    }
                    if produced == out_frames {
                        break;
                    }
                    let frac = (self.state.frac() >> (PHASE_BITS - 15)) as i32;
                    let l = interp(self.x0[0], self.x1[0], frac);
                    let r = if channels == 2 {
                        interp(self.x0[1], self.x1[1], frac)
                    } else {
                        l
                    };
                    let o = produced * 2;
                    out[o] = out[o].saturating_add(l * self.state.vol_l);
                    out[o + 1] = out[o + 1].saturating_add(r * self.state.vol_r);
                    self.state.advance();
                    produced += 1;
                }
                in_idx
            };
            provider.release_buffer(consumed);
        }
        produced
    }

    fn reset(&mut self) {
        self.x0 = [0; 2];
        self.x1 = [0; 2];
        // Two whole frames of pending phase: the first output interpolates
        // real history instead of zeros, so constant input is reproduced
        // exactly from the first frame.
        self.state.phase = 2 * PHASE_ONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::test_util::{dc_samples, provider_from_samples};
    use crate::types::UNITY_GAIN;

    #[test]
    fn test_dc_is_exact_from_first_frame() {
        let mut rs = LinearResampler::new(2, 48000);
        rs.set_sample_rate(44100).unwrap();
        let mut provider = provider_from_samples(&dc_samples(1000, 256, 2), 2);
        let mut out = vec![0i32; 64 * 2];
        let produced = rs.resample(&mut out, 64, &mut provider);
        assert_eq!(produced, 64);
        for &acc in &out {
            assert_eq!(acc, 1000 * UNITY_GAIN);
        }
    }

    #[test]
    fn test_unity_ratio_passthrough() {
        let mut rs = LinearResampler::new(1, 44100);
        rs.set_sample_rate(44100).unwrap();
        let samples: Vec<i16> = (0..32).map(|i| (i * 100) as i16).collect();
        let mut provider = provider_from_samples(&samples, 1);
        let mut out = vec![0i32; 16 * 2];
        let produced = rs.resample(&mut out, 16, &mut provider);
        assert_eq!(produced, 16);
        // At 1:1 with primed history, output n is input n, duplicated to
        // both channels at unity gain
        for i in 0..16 {
            assert_eq!(out[i * 2], (i as i32 * 100) * UNITY_GAIN);
            assert_eq!(out[i * 2 + 1], out[i * 2]);
        }
    }

    #[test]
    fn test_short_provider_stops_early() {
        let mut rs = LinearResampler::new(2, 48000);
        rs.set_sample_rate(48000).unwrap();
        let mut provider = provider_from_samples(&dc_samples(500, 10, 2), 2);
        let mut out = vec![0i32; 64 * 2];
        let produced = rs.resample(&mut out, 64, &mut provider);
        assert!(produced < 64);
        assert!(produced >= 8);
    }

    #[test]
    fn test_downsample_consumes_double() {
        let mut rs = LinearResampler::new(2, 24000);
        rs.set_sample_rate(48000).unwrap();
        let mut provider = provider_from_samples(&dc_samples(100, 100, 2), 2);
        let mut out = vec![0i32; 32 * 2];
        let produced = rs.resample(&mut out, 32, &mut provider);
        assert_eq!(produced, 32);
        // 2 input frames per output, plus the 2-frame priming
        assert_eq!(provider.frames_left(), 100 - (2 * 32 + 2) as usize);
    }

    #[test]
    fn test_volume_scales_accumulation() {
        let mut rs = LinearResampler::new(2, 48000);
        rs.set_sample_rate(48000).unwrap();
        rs.set_volume(UNITY_GAIN / 2, UNITY_GAIN / 4);
        let mut provider = provider_from_samples(&dc_samples(1000, 64, 2), 2);
        let mut out = vec![0i32; 8 * 2];
        rs.resample(&mut out, 8, &mut provider);
        assert_eq!(out[0], 1000 * UNITY_GAIN / 2);
        assert_eq!(out[1], 1000 * UNITY_GAIN / 4);
    }
}
