//! Output and capture threads
//!
//! Every opened output or input owns one thread that owns all of its
//! mutable state. Nothing else locks into the audio path: clients and
//! the server talk to a thread only through its message channel, and
//! shared gain state crosses over through atomics. A control request is
//! applied at the top of the loop, between device writes, never while a
//! block is being mixed.

pub mod playback;
mod priority;
pub mod record;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Sender};

use crate::cblk::BlockProducer;
use crate::config::ServerConfig;
use crate::error::{AudioError, AudioResult};
use crate::params::ParameterMap;
use crate::track::handle::TrackRequest;
use crate::track::{RecordTrack, Track};
use crate::types::{gain_from_float, PcmSpec, StreamType, MAX_GAIN, NUM_STREAM_TYPES, UNITY_GAIN};

/// Everything a thread can be told from outside
pub enum ThreadMsg {
    /// Per-track control from a client handle
    Track(TrackRequest),
    /// Attach a new playback track
    AddTrack {
        track: Box<Track>,
        ack: Sender<AudioResult<()>>,
    },
    /// Attach a new record track with its filling endpoint
    AddRecord {
        track: Box<RecordTrack>,
        producer: BlockProducer,
        ack: Sender<AudioResult<()>>,
    },
    /// Forward key/value parameters to the underlying stream
    SetParameters {
        params: ParameterMap,
        ack: Sender<AudioResult<()>>,
    },
    /// Tear the thread down
    Exit,
}

/// Loop behavior knobs, snapshotted from [`ServerConfig`] at spawn
#[derive(Debug, Clone)]
pub struct ThreadTuning {
    pub standby_timeout: Duration,
    pub max_track_retries: u32,
    pub max_direct_retries: u32,
    pub min_sleep: Duration,
    pub max_sleep_shift: u32,
    pub record_sleep: Duration,
    pub warning_throttle: Duration,
}

impl From<&ServerConfig> for ThreadTuning {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            standby_timeout: Duration::from_millis(cfg.standby_timeout_ms),
            max_track_retries: cfg.max_track_retries,
            max_direct_retries: cfg.max_direct_retries,
            min_sleep: Duration::from_micros(cfg.min_sleep_us),
            max_sleep_shift: cfg.max_sleep_shift,
            record_sleep: Duration::from_micros(cfg.record_sleep_us),
            warning_throttle: Duration::from_millis(cfg.warning_throttle_ms),
        }
    }
}

/// Master and per-stream-type gain, shared lock-free between the server
/// surface (writers) and every playback loop (readers)
pub struct VolumeState {
    master: AtomicI32,
    master_mute: AtomicBool,
    stream: [AtomicI32; NUM_STREAM_TYPES],
    stream_mute: [AtomicBool; NUM_STREAM_TYPES],
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            master: AtomicI32::new(UNITY_GAIN),
            master_mute: AtomicBool::new(false),
            stream: [(); NUM_STREAM_TYPES].map(|_| AtomicI32::new(UNITY_GAIN)),
            stream_mute: [(); NUM_STREAM_TYPES].map(|_| AtomicBool::new(false)),
        }
    }
}

impl VolumeState {
    pub fn set_master_volume(&self, volume: f32) -> AudioResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::BadValue(format!(
                "master volume {} outside [0, 1]",
                volume
            )));
        }
        self.master.store(gain_from_float(volume), Ordering::Relaxed);
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.master.load(Ordering::Relaxed) as f32 / UNITY_GAIN as f32
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.master_mute.store(muted, Ordering::Relaxed);
    }

    pub fn master_muted(&self) -> bool {
        self.master_mute.load(Ordering::Relaxed)
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) -> AudioResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::BadValue(format!(
                "stream volume {} outside [0, 1]",
                volume
            )));
        }
        self.stream[stream as usize].store(gain_from_float(volume), Ordering::Relaxed);
        Ok(())
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.stream[stream as usize].load(Ordering::Relaxed) as f32 / UNITY_GAIN as f32
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.stream_mute[stream as usize].store(muted, Ordering::Relaxed);
    }

    pub fn stream_muted(&self, stream: StreamType) -> bool {
        self.stream_mute[stream as usize].load(Ordering::Relaxed)
    }

    /// Fold master, stream-type, and per-track gain into one 4.12 pair.
    /// Any mute wins outright.
    pub fn compose(
        &self,
        stream: StreamType,
        cblk: (i32, i32),
        track_muted: bool,
    ) -> (i32, i32) {
        if track_muted || self.master_muted() || self.stream_muted(stream) {
            return (0, 0);
        }
        let master = self.master.load(Ordering::Relaxed) as i64;
        let st = self.stream[stream as usize].load(Ordering::Relaxed) as i64;
        let base = (master * st) >> 12;
        let fold = |v: i32| (((base * v as i64) >> 12) as i32).clamp(0, MAX_GAIN);
        (fold(cblk.0), fold(cblk.1))
    }
}

/// Owner handle for a spawned audio thread; dropping it tears the
/// thread down and joins it
pub struct ThreadHandle {
    tx: Sender<ThreadMsg>,
    join: Option<JoinHandle<()>>,
    pub spec: PcmSpec,
    pub frame_count: usize,
    pub latency_ms: u32,
}

impl ThreadHandle {
    pub(crate) fn new(
        tx: Sender<ThreadMsg>,
        join: JoinHandle<()>,
        spec: PcmSpec,
        frame_count: usize,
        latency_ms: u32,
    ) -> Self {
        Self {
            tx,
            join: Some(join),
            spec,
            frame_count,
            latency_ms,
        }
    }

    pub fn control_sender(&self) -> Sender<ThreadMsg> {
        self.tx.clone()
    }

    fn send_acked(&self, make: impl FnOnce(Sender<AudioResult<()>>) -> ThreadMsg) -> AudioResult<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(make(ack_tx))
            .map_err(|_| AudioError::InvalidOperation("thread is gone".into()))?;
        ack_rx
            .recv_timeout(Duration::from_secs(3))
            .map_err(|_| AudioError::TimedOut("thread control"))?
    }

    pub fn add_track(&self, track: Box<Track>) -> AudioResult<()> {
        self.send_acked(|ack| ThreadMsg::AddTrack { track, ack })
    }

    pub fn add_record(&self, track: Box<RecordTrack>, producer: BlockProducer) -> AudioResult<()> {
        self.send_acked(|ack| ThreadMsg::AddRecord {
            track,
            producer,
            ack,
        })
    }

    pub fn set_parameters(&self, params: ParameterMap) -> AudioResult<()> {
        self.send_acked(|ack| ThreadMsg::SetParameters { params, ack })
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(ThreadMsg::Exit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_unity() {
        let v = VolumeState::default();
        assert_eq!(
            v.compose(StreamType::Music, (UNITY_GAIN, UNITY_GAIN), false),
            (UNITY_GAIN, UNITY_GAIN)
        );
    }

    #[test]
    fn test_compose_multiplies_stages() {
        let v = VolumeState::default();
        v.set_master_volume(0.5).unwrap();
        v.set_stream_volume(StreamType::Music, 0.5).unwrap();
        let (l, r) = v.compose(StreamType::Music, (UNITY_GAIN, UNITY_GAIN), false);
        // 0.5 * 0.5 in 4.12, allowing quantization from the float stages
        assert!((l - UNITY_GAIN / 4).abs() <= 4, "left {}", l);
        assert_eq!(l, r);
        // Other stream types are unaffected
        assert!(v.compose(StreamType::Alarm, (UNITY_GAIN, UNITY_GAIN), false).0 > UNITY_GAIN / 3);
    }

    #[test]
    fn test_any_mute_silences() {
        let v = VolumeState::default();
        assert_eq!(v.compose(StreamType::Music, (UNITY_GAIN, UNITY_GAIN), true), (0, 0));
        v.set_master_mute(true);
        assert_eq!(v.compose(StreamType::Music, (UNITY_GAIN, UNITY_GAIN), false), (0, 0));
        v.set_master_mute(false);
        v.set_stream_mute(StreamType::Music, true);
        assert_eq!(v.compose(StreamType::Music, (UNITY_GAIN, UNITY_GAIN), false), (0, 0));
    }

    #[test]
    fn test_volume_range_checked() {
        let v = VolumeState::default();
        assert!(v.set_master_volume(1.5).is_err());
        assert!(v.set_master_volume(-0.1).is_err());
        assert!(v.set_stream_volume(StreamType::Voice, 2.0).is_err());
    }
}
