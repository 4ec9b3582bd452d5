//! Null device that emulates hardware timing
//!
//! Writes sleep for the duration of the frames they carry and reads
//! return silence at capture rate. The server falls back to this when
//! the configured device fails to come up, so a headless box still runs
//! the full track lifecycle.

use std::time::{Duration, Instant};

use crate::error::AudioResult;
use crate::hal::{HalDevice, StreamIn, StreamOut};
use crate::params::ParameterMap;
use crate::types::PcmSpec;

pub struct StubDevice;

impl HalDevice for StubDevice {
    fn init_check(&self) -> AudioResult<()> {
        Ok(())
    }

    fn open_output(
        &mut self,
        spec: &PcmSpec,
        frame_count: usize,
    ) -> AudioResult<Box<dyn StreamOut>> {
        log::info!(
            "stub output: {} Hz, {} frames per period",
            spec.sample_rate,
            frame_count
        );
        Ok(Box::new(StubStreamOut {
            spec: *spec,
            frame_count,
            pace: Pacer::new(spec.sample_rate),
            frames_written: 0,
        }))
    }

    fn open_input(
        &mut self,
        spec: &PcmSpec,
        frame_count: usize,
    ) -> AudioResult<Box<dyn StreamIn>> {
        log::info!(
            "stub input: {} Hz, {} frames per period",
            spec.sample_rate,
            frame_count
        );
        Ok(Box::new(StubStreamIn {
            spec: *spec,
            frame_count,
            pace: Pacer::new(spec.sample_rate),
        }))
    }

    fn set_master_volume(&mut self, _volume: f32) -> AudioResult<()> {
        Ok(())
    }

    fn set_parameters(&mut self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &[&str]) -> ParameterMap {
        ParameterMap::new()
    }
}

/// Real-time pacing against a running deadline, so jitter in one call
/// does not accumulate into drift
struct Pacer {
    sample_rate: u32,
    deadline: Option<Instant>,
}

impl Pacer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            deadline: None,
        }
    }

    fn pace(&mut self, frames: usize) {
        let span = Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate as u64);
        let now = Instant::now();
        let due = match self.deadline {
            // A long gap means the stream went idle; restart the clock
            Some(d) if d + span * 4 > now => d + span,
            _ => now + span,
        };
        self.deadline = Some(due);
        if due > now {
            std::thread::sleep(due - now);
        }
    }

    fn reset(&mut self) {
        self.deadline = None;
    }
}

struct StubStreamOut {
    spec: PcmSpec,
    frame_count: usize,
    pace: Pacer,
    frames_written: u64,
}

impl StreamOut for StubStreamOut {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn buffer_frames(&self) -> usize {
        self.frame_count
    }

    fn latency_ms(&self) -> u32 {
        (self.frame_count as u64 * 1000 / self.spec.sample_rate as u64) as u32
    }

    fn write(&mut self, data: &[u8]) -> AudioResult<usize> {
        let frames = data.len() / self.spec.frame_size();
        self.pace.pace(frames);
        self.frames_written += frames as u64;
        Ok(frames * self.spec.frame_size())
    }

    fn render_position(&self) -> u64 {
        self.frames_written
    }

    fn standby(&mut self) -> AudioResult<()> {
        self.pace.reset();
        Ok(())
    }

    fn set_parameters(&mut self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &[&str]) -> ParameterMap {
        ParameterMap::new()
    }
}

struct StubStreamIn {
    spec: PcmSpec,
    frame_count: usize,
    pace: Pacer,
}

impl StreamIn for StubStreamIn {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn buffer_frames(&self) -> usize {
        self.frame_count
    }

    fn read(&mut self, data: &mut [u8]) -> AudioResult<usize> {
        let frames = data.len() / self.spec.frame_size();
        self.pace.pace(frames);
        data.fill(0);
        Ok(frames * self.spec.frame_size())
    }

    fn frames_lost(&mut self) -> u32 {
        0
    }

    fn standby(&mut self) -> AudioResult<()> {
        self.pace.reset();
        Ok(())
    }

    fn set_parameters(&mut self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }
}
