//! Hardware abstraction layer
//!
//! Output and input threads talk to devices only through [`StreamOut`]
//! and [`StreamIn`], opened from a [`HalDevice`]. Three implementations
//! ship:
//! - **stub**: no hardware, paces writes by sleeping in real time
//! - **cpal**: real devices through the system audio API
//! - **dump**: a tee that wraps any output and mirrors PCM to a file
//!
//! `write` and `read` are blocking by contract; the device's own pacing
//! is the timing source of the server's threads.

pub mod cpal_backend;
pub mod dump;
pub mod stub;

use crate::error::AudioResult;
use crate::params::ParameterMap;
use crate::types::PcmSpec;

/// One opened output stream on a device
pub trait StreamOut: Send {
    fn spec(&self) -> PcmSpec;

    /// Device period in frames; the mix block size is derived from this
    fn buffer_frames(&self) -> usize;

    /// One-way output latency estimate
    fn latency_ms(&self) -> u32;

    /// Blocking write of whole frames. Returns bytes consumed.
    fn write(&mut self, data: &[u8]) -> AudioResult<usize>;

    /// Frames the device has taken since open, for latency accounting
    fn render_position(&self) -> u64;

    /// Release the hardware until the next write
    fn standby(&mut self) -> AudioResult<()>;

    /// Apply routing or format hints. Unknown keys are ignored by
    /// devices that do not understand them.
    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()>;

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap;
}

/// One opened capture stream on a device
pub trait StreamIn: Send {
    fn spec(&self) -> PcmSpec;

    fn buffer_frames(&self) -> usize;

    /// Blocking read of whole frames. Returns bytes filled.
    fn read(&mut self, data: &mut [u8]) -> AudioResult<usize>;

    /// Frames dropped by the device since the last call; clears on read
    fn frames_lost(&mut self) -> u32;

    fn standby(&mut self) -> AudioResult<()>;

    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()>;
}

/// An audio device that can open streams
pub trait HalDevice: Send {
    /// Check that the device came up. Called once before first use.
    fn init_check(&self) -> AudioResult<()>;

    /// Open an output as close to `spec` as the device supports; the
    /// stream reports what it actually got.
    fn open_output(&mut self, spec: &PcmSpec, frame_count: usize)
        -> AudioResult<Box<dyn StreamOut>>;

    fn open_input(&mut self, spec: &PcmSpec, frame_count: usize)
        -> AudioResult<Box<dyn StreamIn>>;

    /// Hardware master gain, if the device has one
    fn set_master_volume(&mut self, volume: f32) -> AudioResult<()>;

    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()>;

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap;
}
