//! Playback loops
//!
//! One loop instance per opened output. Two kinds share the skeleton:
//! - **Mixer**: up to 32 tracks through the software mixer
//! - **Direct**: a single track copied to the device, bypassing the
//!   mixer (format must match the output exactly)
//!
//! A duplicated output is a Mixer loop whose sink is a set of client
//! track handles on *other* playback threads instead of a device; the
//! mixed block fans out as ordinary track writes.
//!
//! The device write paces the loop. When every active track is
//! underrunning the loop sleeps instead of writing, halving the sleep
//! each consecutive dry cycle so a track that refills is picked up
//! quickly. An output with no active tracks at all goes to standby
//! after a timeout and then blocks on its message channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};

use crate::error::{AudioError, AudioResult};
use crate::hal::StreamOut;
use crate::mixer::AudioMixer;
use crate::params::ParameterMap;
use crate::provider::AudioBufferProvider;
use crate::resampler::Quality;
use crate::thread::{priority, ThreadHandle, ThreadMsg, ThreadTuning, VolumeState};
use crate::track::handle::{TrackHandle, TrackOp};
use crate::track::{Track, TrackEvent, TrackState};
use crate::types::{clamp16, PcmSpec, Sample, MAX_GAIN, UNITY_GAIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    Mixer,
    Direct,
}

/// Where a playback loop sends its finished blocks
pub enum OutputSink {
    Stream(Box<dyn StreamOut>),
    /// Fan out to tracks owned by other playback threads
    Tracks(Vec<TrackHandle>),
}

impl OutputSink {
    fn write(&mut self, data: &[u8], block: Duration) -> AudioResult<()> {
        match self {
            OutputSink::Stream(out) => out.write(data).map(|_| ()),
            OutputSink::Tracks(handles) => {
                // The wait budget is set by the slowest target: an output
                // with deep buffering may legitimately hold a block for
                // its whole ring before space opens up
                let wait = handles
                    .iter()
                    .map(|h| h.buffer_duration())
                    .max()
                    .unwrap_or(block)
                    .max(block);
                for handle in handles.iter_mut() {
                    // A stalled target drops this block on that output
                    // only; the others keep flowing
                    if let Err(e) = handle.write(data, wait) {
                        log::debug!("duplicated write to track {} dropped: {}", handle.id(), e);
                    }
                }
                Ok(())
            }
        }
    }

    fn standby(&mut self) {
        match self {
            OutputSink::Stream(out) => {
                if let Err(e) = out.standby() {
                    log::warn!("standby failed: {}", e);
                }
            }
            OutputSink::Tracks(handles) => {
                for handle in handles {
                    let _ = handle.stop();
                }
            }
        }
    }

    fn render_position(&self) -> Option<u64> {
        match self {
            OutputSink::Stream(out) => Some(out.render_position()),
            OutputSink::Tracks(_) => None,
        }
    }

    fn resume(&mut self) {
        if let OutputSink::Tracks(handles) = self {
            for handle in handles {
                if let Err(e) = handle.start() {
                    log::warn!("duplicated output track {} failed to start: {}", handle.id(), e);
                }
            }
        }
    }

    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()> {
        match self {
            OutputSink::Stream(out) => out.set_parameters(params),
            OutputSink::Tracks(_) => Ok(()),
        }
    }
}

struct TrackEntry {
    track: Track,
    slot: Option<crate::mixer::SlotId>,
    last_vol: Option<(i32, i32)>,
}

pub(crate) struct PlaybackLoop {
    kind: PlaybackKind,
    sink: OutputSink,
    spec: PcmSpec,
    frame_count: usize,
    mixer: Option<AudioMixer>,
    tracks: Vec<TrackEntry>,
    rx: Receiver<ThreadMsg>,
    volumes: Arc<VolumeState>,
    tuning: ThreadTuning,
    mix_buf: Vec<Sample>,
    standby: bool,
    sleep_shift: u32,
    /// Whether the previous cycle produced a full mixed block; a partial
    /// one lowers the readiness bar so short tracks still drain
    last_cycle_ready: bool,
    last_warning: Option<Instant>,
}

/// Spawn a playback thread and return its owner handle
pub fn spawn_playback(
    name: &str,
    kind: PlaybackKind,
    sink: OutputSink,
    spec: PcmSpec,
    frame_count: usize,
    quality: Quality,
    volumes: Arc<VolumeState>,
    tuning: ThreadTuning,
) -> AudioResult<ThreadHandle> {
    // Degenerate geometry would divide by zero in every pacing
    // computation below; refuse it here rather than panic on the thread.
    if spec.sample_rate == 0 || frame_count == 0 {
        return Err(AudioError::BadValue(format!(
            "playback loop needs a nonzero rate and block size, got {} Hz x {} frames",
            spec.sample_rate, frame_count
        )));
    }
    let block_ms = (frame_count as u64 * 1000 / spec.sample_rate as u64) as u32;
    let latency_ms = match &sink {
        OutputSink::Stream(out) => out.latency_ms() + block_ms,
        OutputSink::Tracks(_) => block_ms * 2,
    };
    let mixer = match kind {
        PlaybackKind::Mixer => Some(AudioMixer::new(spec, frame_count, quality)),
        PlaybackKind::Direct => None,
    };

    let (tx, rx) = unbounded();
    let worker = PlaybackLoop {
        kind,
        sink,
        spec,
        frame_count,
        mixer,
        tracks: Vec::new(),
        rx,
        volumes,
        tuning,
        mix_buf: vec![0; frame_count * 2],
        standby: true,
        sleep_shift: 0,
        last_cycle_ready: false,
        last_warning: None,
    };
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || worker.run())
        .map_err(|e| AudioError::Hal(e.to_string()))?;
    Ok(ThreadHandle::new(tx, join, spec, frame_count, latency_ms))
}

impl PlaybackLoop {
    fn run(mut self) {
        priority::promote_current_thread();
        let block = Duration::from_nanos(
            self.frame_count as u64 * 1_000_000_000 / self.spec.sample_rate as u64,
        );
        let mut idle_since = Instant::now();

        'main: loop {
            if !self.any_active() {
                if !self.standby && idle_since.elapsed() >= self.tuning.standby_timeout {
                    self.enter_standby();
                }
                let msg = if self.standby {
                    match self.rx.recv() {
                        Ok(m) => m,
                        Err(_) => break 'main,
                    }
                } else {
                    let deadline = idle_since + self.tuning.standby_timeout;
                    match self.rx.recv_deadline(deadline) {
                        Ok(m) => m,
                        Err(RecvTimeoutError::Timeout) => continue 'main,
                        Err(RecvTimeoutError::Disconnected) => break 'main,
                    }
                };
                if !self.handle_msg(msg) {
                    break 'main;
                }
                while let Ok(m) = self.rx.try_recv() {
                    if !self.handle_msg(m) {
                        break 'main;
                    }
                }
                self.reap();
                if self.any_active() {
                    idle_since = Instant::now();
                }
                continue 'main;
            }

            // Active path: control intake never blocks
            while let Ok(m) = self.rx.try_recv() {
                if !self.handle_msg(m) {
                    break 'main;
                }
            }
            if !self.any_active() {
                self.reap();
                idle_since = Instant::now();
                continue 'main;
            }
            if self.standby {
                self.leave_standby();
            }

            let mixed = match self.kind {
                PlaybackKind::Mixer => self.prepare_and_mix(),
                PlaybackKind::Direct => self.mix_direct(),
            };
            if mixed {
                self.sleep_shift = 0;
                self.write_block(block);
            } else {
                // Enabled tracks with nothing ready: progressively shorter
                // sleeps so a refilled track is caught quickly
                let sleep =
                    std::cmp::max((block / 2) / (1u32 << self.sleep_shift), self.tuning.min_sleep);
                if self.sleep_shift < self.tuning.max_sleep_shift {
                    self.sleep_shift += 1;
                }
                std::thread::sleep(sleep);
            }
            self.last_cycle_ready = mixed;
            idle_since = Instant::now();
            self.reap();
        }

        // Teardown: unblock any client still parked on a full ring
        for entry in &self.tracks {
            entry.track.shared.invalidate();
        }
        self.enter_standby();
    }

    fn any_active(&self) -> bool {
        self.tracks.iter().any(|e| e.track.is_active())
    }

    fn enter_standby(&mut self) {
        if !self.standby {
            match self.sink.render_position() {
                Some(pos) => log::info!("output entering standby at frame {}", pos),
                None => log::info!("output entering standby"),
            }
            self.sink.standby();
            self.standby = true;
        }
    }

    fn leave_standby(&mut self) {
        log::debug!("output leaving standby");
        self.sink.resume();
        self.standby = false;
        self.last_cycle_ready = false;
    }

    fn handle_msg(&mut self, msg: ThreadMsg) -> bool {
        match msg {
            ThreadMsg::Exit => false,
            ThreadMsg::AddTrack { track, ack } => {
                let _ = ack.send(self.admit(*track));
                true
            }
            ThreadMsg::AddRecord { ack, .. } => {
                let _ = ack.send(Err(AudioError::InvalidOperation(
                    "playback thread cannot own record tracks".into(),
                )));
                true
            }
            ThreadMsg::SetParameters { params, ack } => {
                let _ = ack.send(self.sink.set_parameters(&params));
                true
            }
            ThreadMsg::Track(req) => {
                let result = self.apply_track_op(req.track_id, req.op);
                if let Some(ack) = req.ack {
                    let _ = ack.send(result);
                }
                true
            }
        }
    }

    fn admit(&mut self, mut track: Track) -> AudioResult<()> {
        match self.kind {
            PlaybackKind::Mixer => {
                let Some(mixer) = self.mixer.as_mut() else {
                    return Err(AudioError::NoInit);
                };
                let slot = mixer.acquire()?;
                let configured = mixer
                    .set_format(slot, track.spec.format)
                    .and_then(|_| mixer.set_layout(slot, track.spec.layout))
                    .and_then(|_| mixer.set_sample_rate(slot, track.spec.sample_rate));
                if let Err(e) = configured {
                    mixer.release(slot);
                    return Err(e);
                }
                let Some(consumer) = track.consumer.take() else {
                    mixer.release(slot);
                    return Err(AudioError::NoInit);
                };
                mixer.set_provider(slot, Box::new(consumer))?;
                log::info!(
                    "track {} attached: {} Hz {:?} {:?}, {:?}",
                    track.id,
                    track.spec.sample_rate,
                    track.spec.format,
                    track.spec.layout,
                    track.stream_type,
                );
                self.tracks.push(TrackEntry {
                    track,
                    slot: Some(slot),
                    last_vol: None,
                });
                Ok(())
            }
            PlaybackKind::Direct => {
                if track.spec != self.spec {
                    return Err(AudioError::BadValue(format!(
                        "direct output requires {} Hz {:?} {:?}",
                        self.spec.sample_rate, self.spec.format, self.spec.layout
                    )));
                }
                log::info!("direct track {} attached", track.id);
                self.tracks.push(TrackEntry {
                    track,
                    slot: None,
                    last_vol: None,
                });
                Ok(())
            }
        }
    }

    fn apply_track_op(&mut self, id: usize, op: TrackOp) -> AudioResult<()> {
        let Some(entry) = self.tracks.iter_mut().find(|e| e.track.id == id) else {
            return Err(AudioError::BadValue(format!("no track {}", id)));
        };
        match op {
            TrackOp::Lifecycle(event) => {
                entry.track.apply(event)?;
                match event {
                    TrackEvent::Start => {
                        entry.track.shared.clear_flags(crate::cblk::flags::UNDERRUN_DISABLED);
                        entry.track.retries_left = self.tuning.max_track_retries;
                    }
                    TrackEvent::Flush => {
                        entry.track.shared.reset();
                        entry.track.filled_once = false;
                        entry.last_vol = None;
                    }
                    _ => {}
                }
                Ok(())
            }
            TrackOp::SetVolume { left, right } => {
                if !(0..=MAX_GAIN).contains(&left) || !(0..=MAX_GAIN).contains(&right) {
                    return Err(AudioError::BadValue(format!(
                        "track gain ({}, {}) outside [0, {}]",
                        left, right, MAX_GAIN
                    )));
                }
                entry.track.shared.set_volume(left, right);
                Ok(())
            }
            TrackOp::Mute(muted) => {
                entry.track.muted = muted;
                Ok(())
            }
            TrackOp::Destroy => {
                entry.track.state = TrackState::Terminated;
                Ok(())
            }
        }
    }

    /// Classify every track, program the mixer, and mix one block.
    /// Returns whether anything was mixed.
    fn prepare_and_mix(&mut self) -> bool {
        let frame_count = self.frame_count;
        let out_rate = self.spec.sample_rate;
        let max_retries = self.tuning.max_track_retries;
        let bar_full = self.last_cycle_ready;
        let Some(mixer) = self.mixer.as_mut() else {
            return false;
        };

        let mut enabled_any = false;
        for entry in &mut self.tracks {
            let Some(slot) = entry.slot else { continue };
            let t = &mut entry.track;
            if !t.is_active() {
                let _ = mixer.enable(slot, false);
                continue;
            }
            let wanted_rate = t.shared.sample_rate();
            if wanted_rate != t.spec.sample_rate {
                // Client retuned the track mid-flight
                match mixer.set_sample_rate(slot, wanted_rate) {
                    Ok(()) => t.spec.sample_rate = wanted_rate,
                    Err(e) => {
                        log::warn!("track {} rate change to {} refused: {}", t.id, wanted_rate, e);
                        t.shared.set_sample_rate(t.spec.sample_rate);
                    }
                }
            }
            let draining = matches!(t.state, TrackState::Stopped | TrackState::Pausing);
            let min_ready = if draining || !bar_full {
                1
            } else if t.spec.sample_rate == out_rate {
                frame_count
            } else {
                // Enough input to resample one full block, plus the
                // interpolation lookahead
                frame_count * t.spec.sample_rate as usize / out_rate as usize + 2
            };
            let ready = t.frames_ready();

            if ready >= min_ready {
                let target = if t.state == TrackState::Pausing {
                    (0, 0)
                } else {
                    self.volumes.compose(t.stream_type, t.shared.volume(), t.muted)
                };
                let ramp = entry.last_vol.is_some_and(|last| last != target);
                let _ = mixer.set_volume(slot, target.0, target.1, ramp);
                entry.last_vol = Some(target);
                let _ = mixer.enable(slot, true);
                t.retries_left = max_retries;
                t.filled_once = true;
                enabled_any = true;
            } else {
                let _ = mixer.enable(slot, false);
                match t.state {
                    TrackState::Stopped => {
                        // Fully drained; park and rewind for a restart
                        t.shared.reset();
                        t.state = TrackState::Idle;
                        t.filled_once = false;
                        entry.last_vol = None;
                    }
                    TrackState::Pausing => {
                        t.state = TrackState::Paused;
                    }
                    _ if t.filled_once => {
                        t.underrun_count += 1;
                        if t.retries_left == 0 {
                            log::warn!(
                                "track {} evicted after {} underruns",
                                t.id,
                                t.underrun_count
                            );
                            t.disable_for_underrun();
                        } else {
                            t.retries_left -= 1;
                        }
                    }
                    // Started but never yet filled: give it time
                    _ => {}
                }
            }
        }

        if enabled_any {
            mixer.process(&mut self.mix_buf);
            for entry in &mut self.tracks {
                match entry.track.state {
                    TrackState::Resuming => entry.track.state = TrackState::Active,
                    // Ramped down across this block
                    TrackState::Pausing => entry.track.state = TrackState::Paused,
                    _ => {}
                }
            }
        }
        enabled_any
    }

    /// Direct output: copy the first active track straight to the block
    /// buffer with composed gain
    fn mix_direct(&mut self) -> bool {
        let frame_count = self.frame_count;
        let Some(entry) = self.tracks.iter_mut().find(|e| e.track.is_active()) else {
            return false;
        };
        let t = &mut entry.track;
        let ready = t.frames_ready();
        if ready == 0 {
            match t.state {
                TrackState::Stopped => {
                    t.shared.reset();
                    t.state = TrackState::Idle;
                    t.filled_once = false;
                }
                TrackState::Pausing => t.state = TrackState::Paused,
                _ if t.filled_once => {
                    t.underrun_count += 1;
                    if t.retries_left == 0 {
                        log::warn!("direct track {} evicted after underrun", t.id);
                        t.disable_for_underrun();
                    } else {
                        t.retries_left -= 1;
                    }
                }
                _ => {}
            }
            return false;
        }

        let (vl, vr) = if t.state == TrackState::Pausing {
            (0, 0)
        } else {
            self.volumes.compose(t.stream_type, t.shared.volume(), t.muted)
        };
        let Some(consumer) = t.consumer.as_mut() else {
            return false;
        };

        let mut done = 0;
        while done < frame_count {
            let got = {
                let Some(buf) = consumer.get_next_buffer(frame_count - done) else {
                    break;
                };
                let input: &[Sample] = bytemuck::cast_slice(buf);
                let frames = input.len() / 2;
                let dst = &mut self.mix_buf[done * 2..(done + frames) * 2];
                if (vl, vr) == (UNITY_GAIN, UNITY_GAIN) {
                    dst.copy_from_slice(input);
                } else {
                    for (o, pair) in dst.chunks_exact_mut(2).zip(input.chunks_exact(2)) {
                        o[0] = clamp16(pair[0] as i32 * vl);
                        o[1] = clamp16(pair[1] as i32 * vr);
                    }
                }
                frames
            };
            consumer.release_buffer(got);
            done += got;
        }
        self.mix_buf[done * 2..].fill(0);
        t.retries_left = self.tuning.max_direct_retries;
        t.filled_once = true;
        match t.state {
            TrackState::Resuming => t.state = TrackState::Active,
            TrackState::Pausing => t.state = TrackState::Paused,
            _ => {}
        }
        done > 0
    }

    fn write_block(&mut self, block: Duration) {
        let data: &[u8] = bytemuck::cast_slice(&self.mix_buf);
        let start = Instant::now();
        match self.sink.write(data, block) {
            Ok(()) => {
                let took = start.elapsed();
                if took > block * 4 {
                    self.warn_throttled(format!(
                        "device write blocked for {:?} (block is {:?})",
                        took, block
                    ));
                }
            }
            Err(e) => {
                self.warn_throttled(format!("device write failed: {}", e));
                // Keep real-time pacing on a broken sink
                std::thread::sleep(block);
            }
        }
    }

    fn warn_throttled(&mut self, message: String) {
        let now = Instant::now();
        let due = self
            .last_warning
            .map_or(true, |last| now - last >= self.tuning.warning_throttle);
        if due {
            log::warn!("{}", message);
            self.last_warning = Some(now);
        }
    }

    /// Remove terminated tracks and free their mixer slots. Runs after
    /// the mix, never inside the classification pass.
    fn reap(&mut self) {
        let mixer = &mut self.mixer;
        self.tracks.retain(|entry| {
            if entry.track.state != TrackState::Terminated {
                return true;
            }
            if let (Some(mixer), Some(slot)) = (mixer.as_mut(), entry.slot) {
                mixer.release(slot);
            }
            entry.track.shared.invalidate();
            log::info!("track {} removed", entry.track.id);
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cblk::new_shared_block;
    use crate::config::ServerConfig;
    use crate::hal::stub::StubDevice;
    use crate::hal::HalDevice;
    use crate::track::handle::TrackHandle;
    use crate::track::ClientId;
    use crate::types::{AudioFormat, ChannelLayout, StreamType};

    fn spec() -> PcmSpec {
        PcmSpec {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            layout: ChannelLayout::Stereo,
        }
    }

    /// Unpaced sink that remembers every byte written to it
    struct CaptureOut {
        data: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl crate::hal::StreamOut for CaptureOut {
        fn spec(&self) -> PcmSpec {
            spec()
        }

        fn buffer_frames(&self) -> usize {
            240
        }

        fn latency_ms(&self) -> u32 {
            5
        }

        fn write(&mut self, data: &[u8]) -> AudioResult<usize> {
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn render_position(&self) -> u64 {
            (self.data.lock().unwrap().len() / 4) as u64
        }

        fn standby(&mut self) -> AudioResult<()> {
            Ok(())
        }

        fn set_parameters(&mut self, _params: &crate::params::ParameterMap) -> AudioResult<()> {
            Ok(())
        }

        fn get_parameters(&self, _keys: &[&str]) -> crate::params::ParameterMap {
            crate::params::ParameterMap::new()
        }
    }

    fn spawn_capture_mixer(tuning: ThreadTuning) -> (ThreadHandle, Arc<std::sync::Mutex<Vec<u8>>>) {
        let data = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = CaptureOut {
            data: Arc::clone(&data),
        };
        let handle = spawn_playback(
            "test-capture-mixer",
            PlaybackKind::Mixer,
            OutputSink::Stream(Box::new(sink)),
            spec(),
            240,
            Quality::Low,
            Arc::new(VolumeState::default()),
            tuning,
        )
        .unwrap();
        (handle, data)
    }

    fn wait_for<F: FnMut() -> bool>(mut done: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn quick_tuning() -> ThreadTuning {
        let mut tuning = ThreadTuning::from(&ServerConfig::default());
        tuning.standby_timeout = Duration::from_millis(50);
        tuning
    }

    fn spawn_stub_mixer() -> ThreadHandle {
        let out = StubDevice.open_output(&spec(), 240).unwrap();
        spawn_playback(
            "test-mixer",
            PlaybackKind::Mixer,
            OutputSink::Stream(out),
            spec(),
            240,
            Quality::Low,
            Arc::new(VolumeState::default()),
            quick_tuning(),
        )
        .unwrap()
    }

    fn make_track(handle: &ThreadHandle, id: usize) -> TrackHandle {
        let (producer, consumer) = new_shared_block(960, 4, 48000).unwrap();
        let shared = Arc::clone(producer.shared());
        let track = Track::new(
            id,
            ClientId(1),
            StreamType::Music,
            spec(),
            Arc::clone(&shared),
            consumer,
            50,
        );
        handle.add_track(Box::new(track)).unwrap();
        TrackHandle::new(id, shared, producer, handle.control_sender())
    }

    #[test]
    fn test_track_lifecycle_through_thread() {
        let thread = spawn_stub_mixer();
        let mut track = make_track(&thread, 1);

        track.start().unwrap();
        // Feed half a second of audio in blocks; the stub paces us
        let data = vec![0u8; 240 * 4];
        for _ in 0..8 {
            track.write(&data, Duration::from_secs(1)).unwrap();
        }
        track.pause().unwrap();
        track.flush().unwrap();
        track.start().unwrap();
        track.stop().unwrap();
        drop(track);
        drop(thread);
    }

    #[test]
    fn test_single_track_at_unity_is_bit_identical() {
        let (thread, data) = spawn_capture_mixer(quick_tuning());
        let mut track = make_track(&thread, 1);

        // Distinct per-sample pattern, four full blocks
        let samples: Vec<i16> = (0..960 * 2).map(|i| (i % 4093) as i16 - 2046).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        track.write(bytes, Duration::from_secs(1)).unwrap();
        track.start().unwrap();

        wait_for(|| data.lock().unwrap().len() >= bytes.len(), "pattern to drain");
        let got = data.lock().unwrap();
        assert_eq!(&got[..bytes.len()], bytes);
    }

    #[test]
    fn test_muted_and_half_volume_mix() {
        let (thread, data) = spawn_capture_mixer(quick_tuning());
        let mut loud = make_track(&thread, 1);
        let mut muted = make_track(&thread, 2);

        let samples = vec![1000i16; 960 * 2];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        loud.write(bytes, Duration::from_secs(1)).unwrap();
        muted.write(bytes, Duration::from_secs(1)).unwrap();

        loud.set_volume(UNITY_GAIN / 2, UNITY_GAIN / 2).unwrap();
        muted.mute(true).unwrap();
        loud.start().unwrap();
        muted.start().unwrap();

        wait_for(|| data.lock().unwrap().len() >= bytes.len(), "mix to drain");
        let got = data.lock().unwrap();
        let mixed: &[i16] = bytemuck::cast_slice(&got[..bytes.len()]);
        // 1000 * 0x0800 rounds to 500; the muted track adds nothing
        assert!(mixed.iter().all(|&s| s == 500), "unexpected sample in {:?}", &mixed[..8]);
    }

    #[test]
    fn test_starving_track_is_evicted_not_hung() {
        let mut tuning = quick_tuning();
        tuning.max_track_retries = 2;
        let (thread, _data) = spawn_capture_mixer(tuning);
        let mut track = make_track(&thread, 1);

        track.write(&vec![1u8; 240 * 4], Duration::from_secs(1)).unwrap();
        track.start().unwrap();

        // One block then nothing; the retry budget runs out quickly
        wait_for(|| track.take_disabled(), "underrun eviction");
        // An evicted track is parked, not terminated: a restart works
        track.start().unwrap();
    }

    #[test]
    fn test_direct_rejects_mismatched_spec() {
        let out = StubDevice.open_output(&spec(), 240).unwrap();
        let thread = spawn_playback(
            "test-direct",
            PlaybackKind::Direct,
            OutputSink::Stream(out),
            spec(),
            240,
            Quality::Low,
            Arc::new(VolumeState::default()),
            quick_tuning(),
        )
        .unwrap();

        let (producer, consumer) = new_shared_block(960, 4, 44100).unwrap();
        let shared = Arc::clone(producer.shared());
        let wrong = PcmSpec {
            sample_rate: 44100,
            ..spec()
        };
        let track = Track::new(1, ClientId(1), StreamType::Music, wrong, shared, consumer, 2);
        assert!(matches!(
            thread.add_track(Box::new(track)),
            Err(AudioError::BadValue(_))
        ));
    }

    #[test]
    fn test_invalid_lifecycle_is_refused() {
        let thread = spawn_stub_mixer();
        let track = make_track(&thread, 1);
        // Pause before start is not a legal move
        assert!(matches!(
            track.pause(),
            Err(AudioError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_bad_volume_is_refused() {
        let thread = spawn_stub_mixer();
        let track = make_track(&thread, 1);
        assert!(track.set_volume(-1, 0).is_err());
        assert!(track.set_volume(UNITY_GAIN, UNITY_GAIN).is_ok());
    }
}
