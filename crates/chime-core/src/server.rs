//! Server facade
//!
//! [`AudioServer`] owns the device, the output and input threads, and
//! the shared volume table. Clients go through it to open outputs and
//! inputs and to create tracks; the handles they get back talk to the
//! owning threads directly, so the server itself is never on the audio
//! path.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::cblk::new_shared_block;
use crate::config::{HalKind, ServerConfig};
use crate::error::{AudioError, AudioResult};
use crate::hal::cpal_backend::CpalDevice;
use crate::hal::dump::DumpStreamOut;
use crate::hal::stub::StubDevice;
use crate::hal::{HalDevice, StreamOut};
use crate::params::ParameterMap;
use crate::thread::playback::{spawn_playback, OutputSink, PlaybackKind};
use crate::thread::record::spawn_record;
use crate::thread::{ThreadHandle, ThreadTuning, VolumeState};
use crate::track::handle::{RecordHandle, TrackHandle};
use crate::track::{ClientId, RecordTrack, Track};
use crate::types::{PcmSpec, StreamType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(u32);

pub struct AudioServer {
    config: ServerConfig,
    hal: Box<dyn HalDevice>,
    volumes: Arc<VolumeState>,
    outputs: HashMap<OutputId, ThreadHandle>,
    inputs: HashMap<InputId, ThreadHandle>,
    next_output: u32,
    next_input: u32,
    next_track: usize,
}

impl AudioServer {
    pub fn new(config: ServerConfig) -> Self {
        let hal = open_hal(&config);
        Self {
            config,
            hal,
            volumes: Arc::new(VolumeState::default()),
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            next_output: 0,
            next_input: 0,
            next_track: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open a mixed output at the server's native rate. Every output
    /// gets its own thread and its own 32-slot mixer.
    pub fn open_output(&mut self) -> AudioResult<OutputId> {
        let spec = self.config.mix_spec();
        let stream = self.hal.open_output(&spec, self.config.frame_count)?;
        let stream = self.wrap_dump(stream);
        // The device may have adjusted both
        let spec = stream.spec();
        let frame_count = stream.buffer_frames();

        let id = OutputId(self.next_output);
        self.next_output += 1;
        let handle = spawn_playback(
            &format!("chime-mixer-{}", id.0),
            PlaybackKind::Mixer,
            OutputSink::Stream(stream),
            spec,
            frame_count,
            self.config.resampler_quality,
            Arc::clone(&self.volumes),
            ThreadTuning::from(&self.config),
        )?;
        log::info!(
            "output {} open: {} Hz, {} frame blocks, {} ms latency",
            id.0,
            spec.sample_rate,
            frame_count,
            handle.latency_ms,
        );
        self.outputs.insert(id, handle);
        Ok(id)
    }

    /// Open an output that carries exactly one track with no mixing or
    /// rate conversion. The track's format must match `spec` exactly.
    pub fn open_direct_output(&mut self, spec: PcmSpec) -> AudioResult<OutputId> {
        let stream = self.hal.open_output(&spec, self.config.frame_count)?;
        let stream = self.wrap_dump(stream);
        let got = stream.spec();
        if got != spec {
            return Err(AudioError::BadValue(format!(
                "device cannot open {} Hz {:?} {:?} directly",
                spec.sample_rate, spec.format, spec.layout
            )));
        }
        let frame_count = stream.buffer_frames();

        let id = OutputId(self.next_output);
        self.next_output += 1;
        let handle = spawn_playback(
            &format!("chime-direct-{}", id.0),
            PlaybackKind::Direct,
            OutputSink::Stream(stream),
            spec,
            frame_count,
            self.config.resampler_quality,
            Arc::clone(&self.volumes),
            ThreadTuning::from(&self.config),
        )?;
        log::info!("direct output {} open: {} Hz", id.0, spec.sample_rate);
        self.outputs.insert(id, handle);
        Ok(id)
    }

    /// Open an output that mixes like a normal one but delivers each
    /// block to every listed output instead of a device. Used to play
    /// the same audio on, say, a speaker and a wired headset at once.
    pub fn open_duplicating_output(&mut self, targets: &[OutputId]) -> AudioResult<OutputId> {
        if targets.is_empty() {
            return Err(AudioError::BadValue("no duplication targets".into()));
        }
        let spec = self.config.mix_spec();
        let frame_count = self.config.frame_count;

        let mut feeds = Vec::with_capacity(targets.len());
        for target in targets {
            feeds.push(self.create_track(
                ClientId(0),
                *target,
                StreamType::Music,
                spec,
                frame_count * 4,
            )?);
        }

        let id = OutputId(self.next_output);
        self.next_output += 1;
        let handle = spawn_playback(
            &format!("chime-dup-{}", id.0),
            PlaybackKind::Mixer,
            OutputSink::Tracks(feeds),
            spec,
            frame_count,
            self.config.resampler_quality,
            Arc::clone(&self.volumes),
            ThreadTuning::from(&self.config),
        )?;
        log::info!("duplicating output {} open onto {} outputs", id.0, targets.len());
        self.outputs.insert(id, handle);
        Ok(id)
    }

    /// Close an output. Joins its thread; any remaining tracks are
    /// invalidated so blocked clients fail fast.
    pub fn close_output(&mut self, id: OutputId) -> AudioResult<()> {
        match self.outputs.remove(&id) {
            Some(handle) => {
                drop(handle);
                log::info!("output {} closed", id.0);
                Ok(())
            }
            None => Err(AudioError::BadValue(format!("no output {}", id.0))),
        }
    }

    /// Open a capture input at the server's native rate
    pub fn open_input(&mut self) -> AudioResult<InputId> {
        let spec = self.config.mix_spec();
        let stream = self.hal.open_input(&spec, self.config.frame_count)?;
        let spec = stream.spec();
        let frame_count = stream.buffer_frames();

        let id = InputId(self.next_input);
        self.next_input += 1;
        let handle = spawn_record(
            &format!("chime-record-{}", id.0),
            stream,
            spec,
            frame_count,
            self.config.resampler_quality,
            ThreadTuning::from(&self.config),
        )?;
        log::info!("input {} open: {} Hz", id.0, spec.sample_rate);
        self.inputs.insert(id, handle);
        Ok(id)
    }

    pub fn close_input(&mut self, id: InputId) -> AudioResult<()> {
        match self.inputs.remove(&id) {
            Some(handle) => {
                drop(handle);
                log::info!("input {} closed", id.0);
                Ok(())
            }
            None => Err(AudioError::BadValue(format!("no input {}", id.0))),
        }
    }

    /// Create a playback track on an output. `frame_count` is the ring
    /// size in frames at the track's own rate; 0 asks for the minimum
    /// that can keep the output fed.
    pub fn create_track(
        &mut self,
        client: ClientId,
        output: OutputId,
        stream_type: StreamType,
        spec: PcmSpec,
        frame_count: usize,
    ) -> AudioResult<TrackHandle> {
        let Some(handle) = self.outputs.get(&output) else {
            return Err(AudioError::BadValue(format!("no output {}", output.0)));
        };
        if spec.sample_rate == 0 || spec.sample_rate > handle.spec.sample_rate * 2 {
            return Err(AudioError::BadValue(format!(
                "track rate {} outside [1, {}]",
                spec.sample_rate,
                handle.spec.sample_rate * 2
            )));
        }
        // Smallest ring that survives one full mix block being taken
        // while the client refills: two blocks at the track's rate
        let min_frames = (2 * handle.frame_count as u64 * spec.sample_rate as u64
            / handle.spec.sample_rate as u64) as usize;
        let frame_count = frame_count.max(min_frames.max(2));

        let track_id = self.next_track;
        self.next_track += 1;
        let (producer, consumer) =
            new_shared_block(frame_count, spec.frame_size(), spec.sample_rate)?;
        let shared = Arc::clone(producer.shared());
        let track = Track::new(
            track_id,
            client,
            stream_type,
            spec,
            Arc::clone(&shared),
            consumer,
            self.config.max_track_retries,
        );
        handle.add_track(Box::new(track))?;
        Ok(TrackHandle::new(
            track_id,
            shared,
            producer,
            handle.control_sender(),
        ))
    }

    /// Create the record track on an input. The capture thread converts
    /// rate and layout when `spec` differs from the input's own; rates
    /// are capped at 2:1 in either direction. The input stays owned
    /// until the handle is dropped.
    pub fn open_record(
        &mut self,
        client: ClientId,
        input: InputId,
        spec: PcmSpec,
        frame_count: usize,
    ) -> AudioResult<RecordHandle> {
        if !self.config.capture_allowed {
            return Err(AudioError::PermissionDenied);
        }
        let Some(handle) = self.inputs.get(&input) else {
            return Err(AudioError::BadValue(format!("no input {}", input.0)));
        };
        if spec.sample_rate == 0
            || spec.sample_rate > handle.spec.sample_rate * 2
            || spec.sample_rate * 2 < handle.spec.sample_rate
        {
            return Err(AudioError::BadValue(format!(
                "capture rate {} outside 2:1 of input rate {}",
                spec.sample_rate, handle.spec.sample_rate
            )));
        }
        // Two input blocks of headroom, scaled to the requested rate
        let min_frames = (2 * handle.frame_count as u64 * spec.sample_rate as u64
            / handle.spec.sample_rate as u64) as usize;
        let frame_count = frame_count.max(min_frames.max(2));

        let track_id = self.next_track;
        self.next_track += 1;
        let (producer, consumer) =
            new_shared_block(frame_count, spec.frame_size(), spec.sample_rate)?;
        let shared = Arc::clone(consumer.shared());
        let track = RecordTrack::new(track_id, client, spec, Arc::clone(&shared));
        handle.add_record(Box::new(track), producer)?;
        Ok(RecordHandle::new(
            track_id,
            shared,
            consumer,
            handle.control_sender(),
        ))
    }

    /// Software master gain, applied inside every mix loop. Also offered
    /// to the hardware, which most devices decline.
    pub fn set_master_volume(&mut self, volume: f32) -> AudioResult<()> {
        self.volumes.set_master_volume(volume)?;
        if let Err(e) = self.hal.set_master_volume(volume) {
            log::debug!("hardware master volume declined: {}", e);
        }
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.volumes.master_volume()
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.volumes.set_master_mute(muted);
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) -> AudioResult<()> {
        self.volumes.set_stream_volume(stream, volume)
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.volumes.stream_volume(stream)
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.volumes.set_stream_mute(stream, muted);
    }

    /// Forward routing or format hints to one output, or to the device
    /// itself when no output is named
    pub fn set_parameters(
        &mut self,
        output: Option<OutputId>,
        params: ParameterMap,
    ) -> AudioResult<()> {
        match output {
            Some(id) => match self.outputs.get(&id) {
                Some(handle) => handle.set_parameters(params),
                None => Err(AudioError::BadValue(format!("no output {}", id.0))),
            },
            None => self.hal.set_parameters(&params),
        }
    }

    pub fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        self.hal.get_parameters(keys)
    }

    pub fn output_latency_ms(&self, id: OutputId) -> AudioResult<u32> {
        self.outputs
            .get(&id)
            .map(|h| h.latency_ms)
            .ok_or_else(|| AudioError::BadValue(format!("no output {}", id.0)))
    }

    /// One-page text status for diagnostics
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "chime audio server");
        let _ = writeln!(
            out,
            "  mix: {} Hz, {} frame blocks, quality {:?}",
            self.config.sample_rate, self.config.frame_count, self.config.resampler_quality
        );
        let _ = writeln!(
            out,
            "  master volume {:.2}{}",
            self.volumes.master_volume(),
            if self.volumes.master_muted() { " (muted)" } else { "" },
        );
        for stream in StreamType::ALL {
            let _ = writeln!(
                out,
                "  {:?} volume {:.2}{}",
                stream,
                self.volumes.stream_volume(stream),
                if self.volumes.stream_muted(stream) { " (muted)" } else { "" },
            );
        }
        let mut ids: Vec<_> = self.outputs.keys().collect();
        ids.sort_by_key(|id| id.0);
        for id in ids {
            let h = &self.outputs[id];
            let _ = writeln!(
                out,
                "  output {}: {} Hz, {} frames, {} ms",
                id.0, h.spec.sample_rate, h.frame_count, h.latency_ms
            );
        }
        let mut ids: Vec<_> = self.inputs.keys().collect();
        ids.sort_by_key(|id| id.0);
        for id in ids {
            let h = &self.inputs[id];
            let _ = writeln!(out, "  input {}: {} Hz, {} frames", id.0, h.spec.sample_rate, h.frame_count);
        }
        out
    }

    fn wrap_dump(&self, stream: Box<dyn StreamOut>) -> Box<dyn StreamOut> {
        let Some(path) = &self.config.dump_path else {
            return stream;
        };
        // Unique file per opened output
        let path = path.join(format!("output-{}.pcm", self.next_output));
        Box::new(DumpStreamOut::create(stream, &path))
    }
}

fn open_hal(config: &ServerConfig) -> Box<dyn HalDevice> {
    match config.hal {
        HalKind::Stub => Box::new(StubDevice),
        HalKind::Generic => match CpalDevice.init_check() {
            Ok(()) => Box::new(CpalDevice),
            Err(e) => {
                log::warn!("audio device unavailable, using stub: {}", e);
                Box::new(StubDevice)
            }
        },
    }
}
