//! Cubic interpolation resampler (medium quality tier)
//!
//! Catmull-Rom segment through four frames of history, evaluated with a
//! Horner chain in Q14. Better stopband behavior than linear at roughly
//! four multiplies per channel per output frame.

use crate::error::AudioResult;
use crate::provider::AudioBufferProvider;
use crate::resampler::{PhaseState, Resampler, PHASE_BITS, PHASE_ONE};
use crate::types::{Accum, Sample};

#[derive(Default, Clone, Copy)]
struct ChannelState {
    x0: i32,
    x1: i32,
    x2: i32,
    x3: i32,
    a: i32,
    b: i32,
    c: i32,
}

impl ChannelState {
    fn push(&mut self, input: i32) {
        self.x0 = self.x1;
        self.x1 = self.x2;
        self.x2 = self.x3;
        self.x3 = input;
        self.a = (3 * (self.x1 - self.x2) - self.x0 + self.x3) >> 1;
        self.b = (self.x2 << 1) + self.x0 - ((5 * self.x1 + self.x3) >> 1);
        self.c = (self.x2 - self.x0) >> 1;
    }

    /// Evaluate the segment at `frac14` between x1 and x2
    fn interp(&self, frac14: i32) -> i32 {
        (((((self.a * frac14 >> 14) + self.b) * frac14 >> 14) + self.c) * frac14 >> 14) + self.x1
    }
}

pub struct CubicResampler {
    state: PhaseState,
    ch: [ChannelState; 2],
}

impl CubicResampler {
    pub fn new(channels: usize, out_rate: u32) -> Self {
        let mut r = Self {
            state: PhaseState::new(channels, out_rate),
            ch: [ChannelState::default(); 2],
        };
        r.reset();
        r
    }
}

impl Resampler for CubicResampler {
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
                            break;
                        }
                        for (c, ch) in self.ch.iter_mut().enumerate().take(channels) {
                            ch.push(input[in_idx * channels + c] as i32);
                        }
                        in_idx += 1;
                        self.state.consume_frame();
                        continue;
                    }
                    if produced == out_frames {
                        break;
                    }
                    let frac = (self.state.frac() >> (PHASE_BITS - 14)) as i32;
                    let l = self.ch[0].interp(frac);
                    let r = if channels == 2 {
                        self.ch[1].interp(frac)
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
        self.ch = [ChannelState::default(); 2];
        // Four frames of pending phase fill the whole window before the
        // first output, which then sits between x1 and x2.
        self.state.phase = 4 * PHASE_ONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::test_util::{dc_samples, provider_from_samples};
    use crate::types::UNITY_GAIN;

    #[test]
    fn test_dc_preserved() {
        // On constant input the Catmull-Rom tangents vanish and the
        // segment degenerates to x1
        let mut rs = CubicResampler::new(2, 48000);
        rs.set_sample_rate(44100).unwrap();
        let mut provider = provider_from_samples(&dc_samples(-2000, 256, 2), 2);
        let mut out = vec![0i32; 32 * 2];
        let produced = rs.resample(&mut out, 32, &mut provider);
        assert_eq!(produced, 32);
        for &acc in &out {
            assert_eq!(acc, -2000 * UNITY_GAIN);
        }
    }

    #[test]
    fn test_unity_ratio_tracks_ramp() {
        // A linear ramp is reproduced exactly by any cubic through its
        // points, modulo Q14 truncation
        let mut rs = CubicResampler::new(1, 44100);
        rs.set_sample_rate(44100).unwrap();
        let samples: Vec<i16> = (0..64).map(|i| (i * 64) as i16).collect();
        let mut provider = provider_from_samples(&samples, 1);
        let mut out = vec![0i32; 32 * 2];
        let produced = rs.resample(&mut out, 32, &mut provider);
        assert_eq!(produced, 32);
        // At 1:1 the fractional phase stays 0, so output n is exactly the
        // window's x1, which is input n+1 after priming
        for i in 0..32 {
            assert_eq!(out[i * 2], ((i as i32 + 1) * 64) * UNITY_GAIN);
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut rs = CubicResampler::new(2, 48000);
        rs.set_sample_rate(48000).unwrap();
        let mut provider = provider_from_samples(&dc_samples(30000, 16, 2), 2);
        let mut out = vec![0i32; 8 * 2];
        rs.resample(&mut out, 8, &mut provider);
        rs.reset();
        let mut silence = provider_from_samples(&dc_samples(0, 16, 2), 2);
        let mut out2 = vec![0i32; 8 * 2];
        rs.resample(&mut out2, 8, &mut silence);
        assert!(out2.iter().all(|&acc| acc == 0));
    }
}
