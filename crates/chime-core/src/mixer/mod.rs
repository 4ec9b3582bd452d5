//! 32-slot software mixer
//!
//! Each slot binds an [`AudioBufferProvider`] to per-slot conversion
//! state: input format, channel layout, sample rate (with a resampler
//! when it differs from the output), and ramped stereo gain. `process`
//! accumulates every enabled slot into a shared `i32` buffer in the
//! 4.12-scaled domain and folds it down to clamped 16-bit PCM.
//!
//! Gain ramps run in Q4.28 (the 4.12 gain left-shifted 16) and advance
//! by truncation toward zero, so a ramp never overshoots its target;
//! whatever residue remains at block end is snapped. A slot whose ramp
//! increment is zero snaps immediately.

use crate::error::{AudioError, AudioResult};
use crate::provider::AudioBufferProvider;
use crate::resampler::{create_resampler, Quality, Resampler};
use crate::types::{
    clamp16, Accum, AudioFormat, ChannelLayout, PcmSpec, Sample, MAX_GAIN, MAX_TRACKS, UNITY_GAIN,
};

const RAMP_SHIFT: u32 = 16;

/// What a slot needs from the mix loop, used to pick the block strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotNeeds {
    pub resample: bool,
    pub ramp: bool,
    pub mono: bool,
    pub format: AudioFormat,
    pub unity: bool,
}

/// Per-block mix strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixStrategy {
    /// No enabled slots: write silence
    Silence,
    /// Single stereo 16-bit slot, no resampling or ramping: scale and
    /// clamp straight into the output without touching the accumulator
    OneTrackStereo,
    /// Everything else goes through the accumulator
    Generic,
}

/// Pick the cheapest loop that is still correct for this block
pub fn select_strategy(enabled: &[SlotNeeds]) -> MixStrategy {
    match enabled {
        [] => MixStrategy::Silence,
        [only]
            if !only.resample
                && !only.ramp
                && !only.mono
                && only.format == AudioFormat::Pcm16 =>
        {
            MixStrategy::OneTrackStereo
        }
        _ => MixStrategy::Generic,
    }
}

struct Slot {
    provider: Option<Box<dyn AudioBufferProvider>>,
    enabled: bool,
    format: AudioFormat,
    layout: ChannelLayout,
    sample_rate: u32,
    resampler: Option<Box<dyn Resampler>>,
    /// Target gain per channel, 4.12
    volume: [i32; 2],
    /// Ramp position per channel, Q4.28
    prev_volume: [i64; 2],
    /// Ramp step per output frame, Q4.28
    volume_inc: [i64; 2],
}

impl Slot {
    fn new(out_rate: u32) -> Self {
        Self {
            provider: None,
            enabled: false,
            format: AudioFormat::Pcm16,
            layout: ChannelLayout::Stereo,
            sample_rate: out_rate,
            resampler: None,
            volume: [UNITY_GAIN; 2],
            prev_volume: [(UNITY_GAIN as i64) << RAMP_SHIFT; 2],
            volume_inc: [0; 2],
        }
    }

    fn ramping(&self) -> bool {
        self.volume_inc != [0; 2]
            || self.prev_volume != [
                (self.volume[0] as i64) << RAMP_SHIFT,
                (self.volume[1] as i64) << RAMP_SHIFT,
            ]
    }

    fn needs(&self) -> SlotNeeds {
        SlotNeeds {
            resample: self.resampler.is_some(),
            ramp: self.ramping(),
            mono: self.layout == ChannelLayout::Mono,
            format: self.format,
            unity: self.volume == [UNITY_GAIN; 2],
        }
    }

    /// Settle the ramp at its target after a block
    fn finish_ramp(&mut self) {
        self.prev_volume = [
            (self.volume[0] as i64) << RAMP_SHIFT,
            (self.volume[1] as i64) << RAMP_SHIFT,
        ];
        self.volume_inc = [0; 2];
    }
}

/// Handle to an acquired mixer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

pub struct AudioMixer {
    out_spec: PcmSpec,
    frame_count: usize,
    quality: Quality,
    slots: Vec<Slot>,
    allocated: u32,
    /// Unity-gain resampler scratch, interleaved stereo accumulator
    scratch: Vec<Accum>,
    accum: Vec<Accum>,
}

impl AudioMixer {
    pub fn new(out_spec: PcmSpec, frame_count: usize, quality: Quality) -> Self {
        Self {
            out_spec,
            frame_count,
            quality,
            slots: (0..MAX_TRACKS).map(|_| Slot::new(out_spec.sample_rate)).collect(),
            allocated: 0,
            scratch: vec![0; frame_count * 2],
            accum: vec![0; frame_count * 2],
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Claim a free slot, lowest index first
    pub fn acquire(&mut self) -> AudioResult<SlotId> {
        let free = (!self.allocated).trailing_zeros() as usize;
        if free >= MAX_TRACKS {
            return Err(AudioError::NoMemory);
        }
        self.allocated |= 1 << free;
        self.slots[free] = Slot::new(self.out_spec.sample_rate);
        Ok(SlotId(free))
    }

    pub fn release(&mut self, id: SlotId) {
        self.allocated &= !(1 << id.0);
        self.slots[id.0] = Slot::new(self.out_spec.sample_rate);
    }

    pub fn active_slots(&self) -> usize {
        self.allocated.count_ones() as usize
    }

    fn slot_mut(&mut self, id: SlotId) -> AudioResult<&mut Slot> {
        if self.allocated & (1 << id.0) == 0 {
            return Err(AudioError::BadValue(format!("slot {} not allocated", id.0)));
        }
        Ok(&mut self.slots[id.0])
    }

    pub fn enable(&mut self, id: SlotId, on: bool) -> AudioResult<()> {
        self.slot_mut(id)?.enabled = on;
        Ok(())
    }

    pub fn set_provider(
        &mut self,
        id: SlotId,
        provider: Box<dyn AudioBufferProvider>,
    ) -> AudioResult<()> {
        self.slot_mut(id)?.provider = Some(provider);
        Ok(())
    }

    pub fn set_format(&mut self, id: SlotId, format: AudioFormat) -> AudioResult<()> {
        let slot = self.slot_mut(id)?;
        if format == AudioFormat::Pcm8 && slot.resampler.is_some() {
            return Err(AudioError::BadValue(
                "8-bit input cannot be resampled".into(),
            ));
        }
        slot.format = format;
        Ok(())
    }

    pub fn set_layout(&mut self, id: SlotId, layout: ChannelLayout) -> AudioResult<()> {
        let out_rate = self.out_spec.sample_rate;
        let quality = self.quality;
        let slot = self.slot_mut(id)?;
        slot.layout = layout;
        // Channel count is baked into the resampler
        if slot.resampler.take().is_some() {
            let mut rs = create_resampler(quality, layout.channels(), out_rate)?;
            rs.set_sample_rate(slot.sample_rate)?;
            slot.resampler = Some(rs);
        }
        Ok(())
    }

    /// Retune a slot. A rate equal to the output drops the resampler;
    /// any other rate creates or retunes one.
    pub fn set_sample_rate(&mut self, id: SlotId, rate: u32) -> AudioResult<()> {
        let out_rate = self.out_spec.sample_rate;
        let quality = self.quality;
        let slot = self.slot_mut(id)?;
        if rate == out_rate {
            slot.resampler = None;
        } else {
            if slot.format == AudioFormat::Pcm8 {
                return Err(AudioError::BadValue(
                    "8-bit input cannot be resampled".into(),
                ));
            }
            match slot.resampler.as_mut() {
                Some(rs) => rs.set_sample_rate(rate)?,
                None => {
                    let mut rs = create_resampler(quality, slot.layout.channels(), out_rate)?;
                    rs.set_sample_rate(rate)?;
                    slot.resampler = Some(rs);
                }
            }
        }
        slot.sample_rate = rate;
        Ok(())
    }

    /// Set target gain, either ramped across the next block or snapped
    pub fn set_volume(&mut self, id: SlotId, left: i32, right: i32, ramp: bool) -> AudioResult<()> {
        if !(0..=MAX_GAIN).contains(&left) || !(0..=MAX_GAIN).contains(&right) {
            return Err(AudioError::BadValue(format!(
                "gain ({}, {}) outside [0, {}]",
                left, right, MAX_GAIN
            )));
        }
        let frames = self.frame_count as i64;
        let slot = self.slot_mut(id)?;
        let target = [left, right];
        if ramp && slot.enabled {
            for ch in 0..2 {
                let to = (target[ch] as i64) << RAMP_SHIFT;
                slot.volume_inc[ch] = (to - slot.prev_volume[ch]) / frames;
            }
            // A vanishing increment would never arrive; snap instead
            if slot.volume_inc == [0; 2] {
                slot.prev_volume = [
                    (target[0] as i64) << RAMP_SHIFT,
                    (target[1] as i64) << RAMP_SHIFT,
                ];
            }
        } else {
            slot.prev_volume = [
                (target[0] as i64) << RAMP_SHIFT,
                (target[1] as i64) << RAMP_SHIFT,
            ];
            slot.volume_inc = [0; 2];
        }
        slot.volume = target;
        Ok(())
    }

    /// Mix one block into `out`, which must hold `frame_count` stereo
    /// frames. Slots whose providers run dry contribute silence for the
    /// missing tail; callers gate enablement on readiness.
    pub fn process(&mut self, out: &mut [Sample]) {
        debug_assert_eq!(out.len(), self.frame_count * 2);
        let enabled: Vec<usize> = (0..MAX_TRACKS)
            .filter(|&i| {
                self.allocated & (1 << i) != 0
                    && self.slots[i].enabled
                    && self.slots[i].provider.is_some()
            })
            .collect();
        let needs: Vec<SlotNeeds> = enabled.iter().map(|&i| self.slots[i].needs()).collect();

        match select_strategy(&needs) {
            MixStrategy::Silence => out.fill(0),
            MixStrategy::OneTrackStereo => self.mix_one_stereo(enabled[0], out),
            MixStrategy::Generic => {
                self.accum.fill(0);
                for &i in &enabled {
                    self.mix_slot(i);
                }
                for (frame, acc) in out.chunks_exact_mut(2).zip(self.accum.chunks_exact(2)) {
                    frame[0] = clamp16(acc[0]);
                    frame[1] = clamp16(acc[1]);
                }
            }
        }
    }

    /// Single stereo 16-bit slot at a settled gain: scale and clamp
    /// straight to the output. Bit-exact passthrough at unity.
    fn mix_one_stereo(&mut self, index: usize, out: &mut [Sample]) {
        let slot = &mut self.slots[index];
        let [vl, vr] = slot.volume;
        let Some(provider) = slot.provider.as_mut() else {
            out.fill(0);
            return;
        };
        let unity = vl == UNITY_GAIN && vr == UNITY_GAIN;

        let mut done = 0;
        while done < self.frame_count {
            let got = {
                let Some(buf) = provider.get_next_buffer(self.frame_count - done) else {
                    break;
                };
                let input: &[Sample] = bytemuck::cast_slice(buf);
                let frames = input.len() / 2;
                let dst = &mut out[done * 2..(done + frames) * 2];
                if unity {
                    dst.copy_from_slice(input);
                } else {
                    for (o, pair) in dst.chunks_exact_mut(2).zip(input.chunks_exact(2)) {
                        o[0] = clamp16(pair[0] as i32 * vl);
                        o[1] = clamp16(pair[1] as i32 * vr);
                    }
                }
                frames
            };
            provider.release_buffer(got);
            done += got;
        }
        out[done * 2..].fill(0);
    }

    /// Accumulate one slot into `self.accum`
    fn mix_slot(&mut self, index: usize) {
        let frame_count = self.frame_count;
        let slot = &mut self.slots[index];
        let ramping = slot.ramping();

        if slot.resampler.is_some() {
            let provider = match slot.provider.as_mut() {
                Some(p) => p,
                None => return,
            };
            let rs = match slot.resampler.as_mut() {
                Some(r) => r,
                None => return,
            };
            if ramping {
                // Resample at unity into scratch, then ramp while folding
                // into the main accumulator
                self.scratch.fill(0);
                rs.set_volume(UNITY_GAIN, UNITY_GAIN);
                let got = rs.resample(&mut self.scratch, frame_count, provider.as_mut());
                let mut prev = slot.prev_volume;
                let inc = slot.volume_inc;
                for f in 0..got {
                    let vl = (prev[0] >> RAMP_SHIFT) as i32;
                    let vr = (prev[1] >> RAMP_SHIFT) as i32;
                    let o = f * 2;
                    // Scratch already carries one 4.12 gain stage; scale
                    // back down after applying the ramped gain
                    self.accum[o] = self.accum[o]
                        .saturating_add(((self.scratch[o] as i64 * vl as i64) >> 12) as i32);
                    self.accum[o + 1] = self.accum[o + 1]
                        .saturating_add(((self.scratch[o + 1] as i64 * vr as i64) >> 12) as i32);
                    prev[0] += inc[0];
                    prev[1] += inc[1];
                }
                slot.finish_ramp();
            } else {
                rs.set_volume(slot.volume[0], slot.volume[1]);
                rs.resample(&mut self.accum, frame_count, provider.as_mut());
            }
            return;
        }

        // Direct-rate path
        let format = slot.format;
        let mono = slot.layout == ChannelLayout::Mono;
        let in_frame_size = slot.layout.channels() * format.bytes_per_sample();
        let mut prev = slot.prev_volume;
        let inc = slot.volume_inc;
        let [tvl, tvr] = slot.volume;
        let provider = match slot.provider.as_mut() {
            Some(p) => p,
            None => return,
        };

        let mut done = 0;
        while done < frame_count {
            let got = {
                let Some(buf) = provider.get_next_buffer(frame_count - done) else {
                    break;
                };
                let frames = (buf.len() / in_frame_size).min(frame_count - done);
                for f in 0..frames {
                    let (l, r) = decode_frame(buf, f, format, mono);
                    let (vl, vr) = if ramping {
                        ((prev[0] >> RAMP_SHIFT) as i32, (prev[1] >> RAMP_SHIFT) as i32)
                    } else {
                        (tvl, tvr)
                    };
                    let o = (done + f) * 2;
                    self.accum[o] = self.accum[o].saturating_add(l * vl);
                    self.accum[o + 1] = self.accum[o + 1].saturating_add(r * vr);
                    if ramping {
                        prev[0] += inc[0];
                        prev[1] += inc[1];
                    }
                }
                frames
            };
            provider.release_buffer(got);
            done += got;
        }
        if ramping {
            slot.finish_ramp();
        }
    }
}

/// Decode frame `f` of a raw input buffer to a stereo pair of 16-bit
/// samples widened to i32. 8-bit input is unsigned and centered at 128.
#[inline]
fn decode_frame(buf: &[u8], f: usize, format: AudioFormat, mono: bool) -> (i32, i32) {
    match format {
        AudioFormat::Pcm16 => {
            let samples: &[Sample] = bytemuck::cast_slice(buf);
            if mono {
                let s = samples[f] as i32;
                (s, s)
            } else {
                (samples[f * 2] as i32, samples[f * 2 + 1] as i32)
            }
        }
        AudioFormat::Pcm8 => {
            if mono {
                let s = ((buf[f] as i32) - 128) << 8;
                (s, s)
            } else {
                (
                    ((buf[f * 2] as i32) - 128) << 8,
                    ((buf[f * 2 + 1] as i32) - 128) << 8,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn out_spec() -> PcmSpec {
        PcmSpec {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            layout: ChannelLayout::Stereo,
        }
    }

    fn stereo16(samples: &[i16]) -> Box<MemoryProvider> {
        Box::new(MemoryProvider::new(
            bytemuck::cast_slice(samples).to_vec(),
            4,
        ))
    }

    fn mixer(frames: usize) -> AudioMixer {
        AudioMixer::new(out_spec(), frames, Quality::Low)
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut mx = mixer(64);
        let mut ids = Vec::new();
        for _ in 0..MAX_TRACKS {
            ids.push(mx.acquire().unwrap());
        }
        assert!(matches!(mx.acquire(), Err(AudioError::NoMemory)));
        mx.release(ids[5]);
        assert_eq!(mx.acquire().unwrap(), SlotId(5));
    }

    #[test]
    fn test_silence_without_tracks() {
        let mut mx = mixer(8);
        let mut out = vec![123i16; 16];
        mx.process(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_one_track_unity_is_bit_exact() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        let samples: Vec<i16> = vec![100, -100, 32767, -32768, 5, -5, 0, 9];
        mx.set_provider(id, stereo16(&samples)).unwrap();
        mx.enable(id, true).unwrap();
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_two_tracks_sum() {
        let mut mx = mixer(4);
        for _ in 0..2 {
            let id = mx.acquire().unwrap();
            mx.set_provider(id, stereo16(&[1000i16; 8])).unwrap();
            mx.enable(id, true).unwrap();
        }
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        assert!(out.iter().all(|&s| s == 2000));
    }

    #[test]
    fn test_many_full_scale_tracks_clamp() {
        let mut mx = mixer(4);
        for _ in 0..MAX_TRACKS {
            let id = mx.acquire().unwrap();
            mx.set_provider(id, stereo16(&[32767i16; 8])).unwrap();
            mx.enable(id, true).unwrap();
        }
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        // 32 rail-to-rail tracks overflow any i32 accumulator format; the
        // sum must pin at the rail, never wrap negative
        assert!(out.iter().all(|&s| s == 32767));
    }

    #[test]
    fn test_half_gain() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        mx.set_provider(id, stereo16(&[10000i16; 8])).unwrap();
        mx.enable(id, true).unwrap();
        mx.set_volume(id, UNITY_GAIN / 2, UNITY_GAIN / 2, false).unwrap();
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        assert!(out.iter().all(|&s| s == 5000));
    }

    #[test]
    fn test_ramp_is_monotonic_and_lands() {
        let mut mx = mixer(64);
        let id = mx.acquire().unwrap();
        mx.set_provider(id, stereo16(&[20000i16; 256])).unwrap();
        mx.enable(id, true).unwrap();
        mx.set_volume(id, 0, 0, false).unwrap();
        mx.set_volume(id, UNITY_GAIN, UNITY_GAIN, true).unwrap();

        let mut out = vec![0i16; 128];
        mx.process(&mut out);
        let left: Vec<i16> = out.iter().step_by(2).copied().collect();
        for w in left.windows(2) {
            assert!(w[1] >= w[0], "ramp went backwards: {:?}", w);
        }
        assert!(left[0] < 1000);

        // Next block runs at the settled target
        let mut out2 = vec![0i16; 128];
        mx.process(&mut out2);
        assert!(out2.iter().all(|&s| s == 20000));
    }

    #[test]
    fn test_snap_without_ramp_applies_immediately() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        mx.set_provider(id, stereo16(&[10000i16; 16])).unwrap();
        mx.enable(id, true).unwrap();
        mx.set_volume(id, UNITY_GAIN / 4, UNITY_GAIN / 4, false).unwrap();
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        assert!(out.iter().all(|&s| s == 2500));
    }

    #[test]
    fn test_mono_duplicates_to_both_channels() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        let mono: Vec<i16> = vec![11, 22, 33, 44];
        mx.set_layout(id, ChannelLayout::Mono).unwrap();
        mx.set_provider(
            id,
            Box::new(MemoryProvider::new(bytemuck::cast_slice(&mono).to_vec(), 2)),
        )
        .unwrap();
        mx.enable(id, true).unwrap();
        let mut out = vec![0i16; 8];
        mx.process(&mut out);
        assert_eq!(out, vec![11, 11, 22, 22, 33, 33, 44, 44]);
    }

    #[test]
    fn test_pcm8_centered_and_widened() {
        let mut mx = mixer(2);
        let id = mx.acquire().unwrap();
        mx.set_format(id, AudioFormat::Pcm8).unwrap();
        // 128 is silence, 129 is one step up, 127 one step down
        mx.set_provider(id, Box::new(MemoryProvider::new(vec![128, 128, 129, 127], 2)))
            .unwrap();
        mx.enable(id, true).unwrap();
        let mut out = vec![0i16; 4];
        mx.process(&mut out);
        assert_eq!(out, vec![0, 0, 256, -256]);
    }

    #[test]
    fn test_pcm8_cannot_resample() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        mx.set_format(id, AudioFormat::Pcm8).unwrap();
        assert!(mx.set_sample_rate(id, 44100).is_err());
        // And the other order
        let id2 = mx.acquire().unwrap();
        mx.set_sample_rate(id2, 44100).unwrap();
        assert!(mx.set_format(id2, AudioFormat::Pcm8).is_err());
    }

    #[test]
    fn test_resampled_track_mixes() {
        let mut mx = mixer(32);
        let id = mx.acquire().unwrap();
        mx.set_sample_rate(id, 24000).unwrap();
        mx.set_provider(id, stereo16(&[4000i16; 256])).unwrap();
        mx.enable(id, true).unwrap();
        let mut out = vec![0i16; 64];
        mx.process(&mut out);
        assert!(out.iter().all(|&s| s == 4000));
    }

    #[test]
    fn test_short_provider_pads_with_silence() {
        let mut mx = mixer(8);
        let a = mx.acquire().unwrap();
        mx.set_provider(a, stereo16(&[1000i16; 8])).unwrap(); // 4 frames
        mx.enable(a, true).unwrap();
        let b = mx.acquire().unwrap();
        mx.set_provider(b, stereo16(&[500i16; 16])).unwrap(); // 8 frames
        mx.enable(b, true).unwrap();
        let mut out = vec![0i16; 16];
        mx.process(&mut out);
        assert_eq!(&out[..8], &[1500i16; 8]);
        assert_eq!(&out[8..], &[500i16; 8]);
    }

    #[test]
    fn test_strategy_selection() {
        let stereo = SlotNeeds {
            resample: false,
            ramp: false,
            mono: false,
            format: AudioFormat::Pcm16,
            unity: true,
        };
        assert_eq!(select_strategy(&[]), MixStrategy::Silence);
        assert_eq!(select_strategy(&[stereo]), MixStrategy::OneTrackStereo);
        assert_eq!(
            select_strategy(&[stereo, stereo]),
            MixStrategy::Generic
        );
        let ramping = SlotNeeds { ramp: true, ..stereo };
        assert_eq!(select_strategy(&[ramping]), MixStrategy::Generic);
        let resampled = SlotNeeds { resample: true, ..stereo };
        assert_eq!(select_strategy(&[resampled]), MixStrategy::Generic);
    }

    #[test]
    fn test_gain_range_checked() {
        let mut mx = mixer(4);
        let id = mx.acquire().unwrap();
        assert!(mx.set_volume(id, -1, 0, false).is_err());
        assert!(mx.set_volume(id, 0, MAX_GAIN + 1, false).is_err());
        assert!(mx.set_volume(id, MAX_GAIN, MAX_GAIN, false).is_ok());
    }
}
