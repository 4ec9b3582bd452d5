//! Windowed-sinc polyphase resampler (high quality tier)
//!
//! 16-tap FIR built from a Blackman-Harris windowed sinc, stored as a
//! half kernel of 64 phases in Q1.30 and linearly interpolated between
//! adjacent phases at evaluation time. Two kernels are generated at
//! construction: a full-bandwidth one for upsampling and a 0.24-cutoff
//! one sized for downsampling ratios up to 2:1. `set_sample_rate` picks
//! between them.
//!
//! The kernel is DC-normalized, and integer tap positions of the
//! full-bandwidth kernel quantize to exact zero, so a 1:1 ratio is a
//! pure [`HALF_TAPS`]-frame delay.

use std::f64::consts::PI;

use crate::error::AudioResult;
use crate::provider::AudioBufferProvider;
use crate::resampler::{PhaseState, Resampler, PHASE_BITS, PHASE_ONE};
use crate::types::{Accum, Sample};

pub const HALF_TAPS: usize = 8;
const TAPS: usize = 2 * HALF_TAPS;
const NUM_PHASES: usize = 64;
const PHASE_INDEX_BITS: u32 = 6;
const COEF_BITS: u32 = 30;
/// Bits of linear interpolation between adjacent phase rows
const LERP_BITS: u32 = 16;

pub struct SincResampler {
    state: PhaseState,
    /// `(NUM_PHASES + 2) * HALF_TAPS` Q1.30 coefficients; the extra rows
    /// keep phase-edge lerp reads in bounds
    up_coefs: Vec<i32>,
    down_coefs: Vec<i32>,
    use_down: bool,
    hist: [[Sample; TAPS]; 2],
}

impl SincResampler {
    pub fn new(channels: usize, out_rate: u32) -> Self {
        let mut r = Self {
            state: PhaseState::new(channels, out_rate),
            up_coefs: build_kernel(0.5),
            down_coefs: build_kernel(0.24),
            use_down: false,
            hist: [[0; TAPS]; 2],
        };
        r.reset();
        r
    }

    fn push(&mut self, input: &[Sample], in_idx: usize) {
        for c in 0..self.state.channels {
            let h = &mut self.hist[c];
            h.copy_within(1.., 0);
            h[TAPS - 1] = input[in_idx * self.state.channels + c];
        }
    }

    fn fir(&self, channel: usize, frac: u64) -> i32 {
        let coefs = if self.use_down {
            &self.down_coefs
        } else {
            &self.up_coefs
        };
        let (pl, ll) = split_phase(frac);
        let (pr, lr) = split_phase(PHASE_ONE - frac);
        let h = &self.hist[channel];
        let mut acc: i64 = 0;
        for k in 0..HALF_TAPS {
            let cl = lerp_coef(coefs[pl * HALF_TAPS + k], coefs[(pl + 1) * HALF_TAPS + k], ll);
            acc += cl * h[HALF_TAPS - 1 - k] as i64;
            let cr = lerp_coef(coefs[pr * HALF_TAPS + k], coefs[(pr + 1) * HALF_TAPS + k], lr);
            acc += cr * h[HALF_TAPS + k] as i64;
        }
        (acc >> COEF_BITS) as i32
    }
}

/// Split a 30-bit phase fraction into a phase row index and a 16-bit
/// inter-row lerp factor
#[inline]
fn split_phase(frac: u64) -> (usize, i64) {
    let index = (frac >> (PHASE_BITS - PHASE_INDEX_BITS)) as usize;
    let lerp = ((frac >> (PHASE_BITS - PHASE_INDEX_BITS - LERP_BITS)) & ((1 << LERP_BITS) - 1)) as i64;
    (index, lerp)
}

#[inline]
fn lerp_coef(c0: i32, c1: i32, lerp: i64) -> i64 {
    c0 as i64 + (((c1 - c0) as i64 * lerp) >> LERP_BITS)
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// 4-term Blackman-Harris over the tap span `[-HALF_TAPS, HALF_TAPS]`,
/// evaluated at offset `t >= 0` from the center
fn window(t: f64) -> f64 {
    if t >= HALF_TAPS as f64 {
        return 0.0;
    }
    let n = (t + HALF_TAPS as f64) / TAPS as f64;
    0.35875 - 0.48829 * (2.0 * PI * n).cos() + 0.14128 * (4.0 * PI * n).cos()
        - 0.01168 * (6.0 * PI * n).cos()
}

/// Generate the phase-indexed half kernel for cutoff `fc` (cycles per
/// input frame), DC-normalized
fn build_kernel(fc: f64) -> Vec<i32> {
    let tap = |t: f64| 2.0 * fc * sinc(2.0 * fc * t) * window(t);
    // DC gain at phase 0: center tap plus both symmetric sides
    let mut dc = tap(0.0);
    for k in 1..=HALF_TAPS {
        dc += 2.0 * tap(k as f64);
    }
    let scale = (1i64 << COEF_BITS) as f64 / dc;

    let mut coefs = vec![0i32; (NUM_PHASES + 2) * HALF_TAPS];
    for p in 0..=NUM_PHASES {
        for k in 0..HALF_TAPS {
            let t = k as f64 + p as f64 / NUM_PHASES as f64;
            coefs[p * HALF_TAPS + k] = (tap(t) * scale).round() as i32;
        }
    }
    // Row NUM_PHASES + 1 stays zero: it is only read lerp-weighted when
    // the right-side phase lands exactly on PHASE_ONE.
    coefs
}

impl Resampler for SincResampler {
    fn set_sample_rate(&mut self, in_rate: u32) -> AudioResult<()> {
        self.state.set_in_rate(in_rate)?;
        self.use_down = in_rate > self.state.out_rate;
        Ok(())
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
                        self.push(input, in_idx);
                        in_idx += 1;
                        self.state.consume_frame();
                        continue;
                    }
                    if produced == out_frames {
                        break;
                    }
                    let frac = self.state.frac();
                    let l = self.fir(0, frac);
                    let r = if channels == 2 { self.fir(1, frac) } else { l };
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
        self.hist = [[0; TAPS]; 2];
        // Fill the whole FIR window before the first output
        self.state.phase = TAPS as u64 * PHASE_ONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::test_util::{dc_samples, provider_from_samples};
    use crate::types::UNITY_GAIN;

    #[test]
    fn test_unity_ratio_is_pure_delay() {
        let mut rs = SincResampler::new(1, 48000);
        rs.set_sample_rate(48000).unwrap();
        let samples: Vec<i16> = (0..64).map(|i| (i as i16 - 32) * 911).collect();
        let mut provider = provider_from_samples(&samples, 1);
        let mut out = vec![0i32; 32 * 2];
        let produced = rs.resample(&mut out, 32, &mut provider);
        assert_eq!(produced, 32);
        for i in 0..32 {
            let expected = ((i as i32 + HALF_TAPS as i32 - 1 - 32) * 911) * UNITY_GAIN;
            assert_eq!(out[i * 2], expected, "frame {}", i);
            assert_eq!(out[i * 2 + 1], expected);
        }
    }

    #[test]
    fn test_dc_within_passband_ripple() {
        let mut rs = SincResampler::new(2, 48000);
        rs.set_sample_rate(44100).unwrap();
        let mut provider = provider_from_samples(&dc_samples(10000, 512, 2), 2);
        let mut out = vec![0i32; 64 * 2];
        let produced = rs.resample(&mut out, 64, &mut provider);
        assert_eq!(produced, 64);
        let target = 10000 * UNITY_GAIN;
        for &acc in &out {
            let err = (acc - target).abs();
            assert!(err <= target / 50, "dc error {} of {}", err, target);
        }
    }

    #[test]
    fn test_downsample_uses_narrow_kernel() {
        let mut rs = SincResampler::new(2, 24000);
        rs.set_sample_rate(48000).unwrap();
        let mut provider = provider_from_samples(&dc_samples(8000, 512, 2), 2);
        let mut out = vec![0i32; 64 * 2];
        let produced = rs.resample(&mut out, 64, &mut provider);
        assert_eq!(produced, 64);
        let target = 8000 * UNITY_GAIN;
        for &acc in &out {
            assert!((acc - target).abs() <= target / 50);
        }
    }

    #[test]
    fn test_kernel_center_tap_is_unity() {
        let coefs = build_kernel(0.5);
        assert_eq!(coefs[0], 1 << COEF_BITS);
        // Integer tap positions of the full-bandwidth sinc are zeros
        for k in 1..HALF_TAPS {
            assert_eq!(coefs[k], 0, "tap {}", k);
        }
    }
}
