//! Real device backend through CPAL
//!
//! CPAL streams are not `Send`, so each opened stream lives on a holder
//! thread that builds it, reports readiness back, and then parks until
//! the handle is dropped. Audio crosses between the server thread and
//! the CPAL callback through an rtrb SPSC ring: `write` pushes samples
//! and sleeps while the ring is full, which makes the device callback
//! the timing source exactly like a blocking ALSA write would be.
//!
//! Underruns in the callback render silence rather than stalling; the
//! server side sees them only as extra space appearing at once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::{AudioError, AudioResult};
use crate::hal::{HalDevice, StreamIn, StreamOut};
use crate::params::{keys, ParameterMap};
use crate::types::{AudioFormat, PcmSpec, Sample};

const PUSH_BACKOFF: Duration = Duration::from_micros(500);

pub struct CpalDevice;

impl HalDevice for CpalDevice {
    fn init_check(&self) -> AudioResult<()> {
        cpal::default_host()
            .default_output_device()
            .map(|_| ())
            .ok_or_else(|| AudioError::Hal("no default output device".into()))
    }

    fn open_output(
        &mut self,
        spec: &PcmSpec,
        frame_count: usize,
    ) -> AudioResult<Box<dyn StreamOut>> {
        if spec.format != AudioFormat::Pcm16 {
            return Err(AudioError::BadValue(
                "device output streams are 16-bit PCM".into(),
            ));
        }
        let channels = spec.layout.channels();
        let capacity = (frame_count * channels * 4).max(channels * 512);
        let (producer, consumer) = rtrb::RingBuffer::<Sample>::new(capacity);
        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let alive = Arc::new(AtomicBool::new(true));

        let rate = spec.sample_rate;
        let thread_alive = Arc::clone(&alive);
        thread::Builder::new()
            .name("chime-cpal-out".into())
            .spawn(move || {
                hold_output(rate, channels as u16, consumer, ready_tx, stop_rx);
                thread_alive.store(false, Ordering::Release);
            })
            .map_err(|e| AudioError::Hal(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Hal("output holder exited before start".into()))?
            .map_err(AudioError::Hal)?;

        Ok(Box::new(CpalStreamOut {
            spec: *spec,
            frame_count,
            producer,
            alive,
            frames_written: 0,
            _stop: stop_tx,
        }))
    }

    fn open_input(
        &mut self,
        spec: &PcmSpec,
        frame_count: usize,
    ) -> AudioResult<Box<dyn StreamIn>> {
        if spec.format != AudioFormat::Pcm16 {
            return Err(AudioError::BadValue(
                "device input streams are 16-bit PCM".into(),
            ));
        }
        let channels = spec.layout.channels();
        let capacity = (frame_count * channels * 4).max(channels * 512);
        let (producer, consumer) = rtrb::RingBuffer::<Sample>::new(capacity);
        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let alive = Arc::new(AtomicBool::new(true));
        let lost = Arc::new(AtomicU32::new(0));

        let rate = spec.sample_rate;
        let thread_alive = Arc::clone(&alive);
        let thread_lost = Arc::clone(&lost);
        thread::Builder::new()
            .name("chime-cpal-in".into())
            .spawn(move || {
                hold_input(rate, channels as u16, producer, thread_lost, ready_tx, stop_rx);
                thread_alive.store(false, Ordering::Release);
            })
            .map_err(|e| AudioError::Hal(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Hal("input holder exited before start".into()))?
            .map_err(AudioError::Hal)?;

        Ok(Box::new(CpalStreamIn {
            spec: *spec,
            frame_count,
            consumer,
            alive,
            lost,
            _stop: stop_tx,
        }))
    }

    fn set_master_volume(&mut self, _volume: f32) -> AudioResult<()> {
        // No hardware gain exposed through CPAL; the mixer applies it
        Err(AudioError::InvalidOperation(
            "no hardware master volume".into(),
        ))
    }

    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()> {
        if let Some(route) = params.get(keys::ROUTING) {
            log::info!("routing request ignored by cpal device: {}", route);
        }
        Ok(())
    }

    fn get_parameters(&self, _keys: &[&str]) -> ParameterMap {
        ParameterMap::new()
    }
}

fn hold_output(
    rate: u32,
    channels: u16,
    mut consumer: rtrb::Consumer<Sample>,
    ready_tx: Sender<Result<(), String>>,
    stop_rx: Receiver<()>,
) {
    let build = move || -> Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or("no default output device")?;
        log::info!(
            "cpal output on {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(rate),
            buffer_size: BufferSize::Default,
        };
        let sample_format = device
            .default_output_config()
            .map_err(|e| e.to_string())?
            .sample_format();
        let err_fn = |e: cpal::StreamError| log::warn!("output stream error: {}", e);
        let stream = match sample_format {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for s in out.iter_mut() {
                        *s = consumer.pop().unwrap_or(0);
                    }
                },
                err_fn,
                None,
            ),
            _ => device.build_output_stream(
                &config,
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for s in out.iter_mut() {
                        *s = consumer.pop().unwrap_or(0) as f32 / 32768.0;
                    }
                },
                err_fn,
                None,
            ),
        }
        .map_err(|e| e.to_string())?;
        stream.play().map_err(|e| e.to_string())?;
        Ok(stream)
    };

    match build() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            // Park until the handle side drops its stop sender
            let _ = stop_rx.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn hold_input(
    rate: u32,
    channels: u16,
    mut producer: rtrb::Producer<Sample>,
    lost: Arc<AtomicU32>,
    ready_tx: Sender<Result<(), String>>,
    stop_rx: Receiver<()>,
) {
    let build = move || -> Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or("no default input device")?;
        log::info!(
            "cpal input on {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(rate),
            buffer_size: BufferSize::Default,
        };
        let sample_format = device
            .default_input_config()
            .map_err(|e| e.to_string())?
            .sample_format();
        let err_fn = |e: cpal::StreamError| log::warn!("input stream error: {}", e);
        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for (i, &s) in data.iter().enumerate() {
                        // Overrun drops the newest samples; the counter
                        // surfaces them through frames_lost
                        if producer.push(s).is_err() {
                            lost.fetch_add((data.len() - i) as u32, Ordering::Relaxed);
                            break;
                        }
                    }
                },
                err_fn,
                None,
            ),
            _ => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for (i, &s) in data.iter().enumerate() {
                        let q = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                        if producer.push(q).is_err() {
                            lost.fetch_add((data.len() - i) as u32, Ordering::Relaxed);
                            break;
                        }
                    }
                },
                err_fn,
                None,
            ),
        }
        .map_err(|e| e.to_string())?;
        stream.play().map_err(|e| e.to_string())?;
        Ok(stream)
    };

    match build() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

struct CpalStreamOut {
    spec: PcmSpec,
    frame_count: usize,
    producer: rtrb::Producer<Sample>,
    alive: Arc<AtomicBool>,
    frames_written: u64,
    _stop: Sender<()>,
}

impl StreamOut for CpalStreamOut {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn buffer_frames(&self) -> usize {
        self.frame_count
    }

    fn latency_ms(&self) -> u32 {
        // Ring plus one device period, rounded up
        (self.frame_count as u64 * 2 * 1000).div_ceil(self.spec.sample_rate as u64) as u32
    }

    fn write(&mut self, data: &[u8]) -> AudioResult<usize> {
        let samples: &[Sample] = bytemuck::cast_slice(data);
        for &s in samples {
            loop {
                if !self.alive.load(Ordering::Acquire) {
                    return Err(AudioError::Hal("output stream is gone".into()));
                }
                match self.producer.push(s) {
                    Ok(()) => break,
                    Err(_) => thread::sleep(PUSH_BACKOFF),
                }
            }
        }
        self.frames_written += (samples.len() / self.spec.layout.channels()) as u64;
        Ok(data.len())
    }

    fn render_position(&self) -> u64 {
        self.frames_written
    }

    fn standby(&mut self) -> AudioResult<()> {
        // The callback renders silence while the ring is empty
        Ok(())
    }

    fn set_parameters(&mut self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }

    fn get_parameters(&self, keys_wanted: &[&str]) -> ParameterMap {
        let mut map = ParameterMap::new();
        if keys_wanted.contains(&keys::SAMPLING_RATE) {
            map.set_int(keys::SAMPLING_RATE, self.spec.sample_rate as i64);
        }
        map
    }
}

struct CpalStreamIn {
    spec: PcmSpec,
    frame_count: usize,
    consumer: rtrb::Consumer<Sample>,
    alive: Arc<AtomicBool>,
    lost: Arc<AtomicU32>,
    _stop: Sender<()>,
}

impl StreamIn for CpalStreamIn {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn buffer_frames(&self) -> usize {
        self.frame_count
    }

    fn read(&mut self, data: &mut [u8]) -> AudioResult<usize> {
        let samples: &mut [Sample] = bytemuck::cast_slice_mut(data);
        let mut filled = 0;
        while filled < samples.len() {
            if !self.alive.load(Ordering::Acquire) {
                return Err(AudioError::Hal("input stream is gone".into()));
            }
            match self.consumer.pop() {
                Ok(s) => {
                    samples[filled] = s;
                    filled += 1;
                }
                Err(_) => thread::sleep(PUSH_BACKOFF),
            }
        }
        Ok(data.len())
    }

    fn frames_lost(&mut self) -> u32 {
        self.lost.swap(0, Ordering::Relaxed) / self.spec.layout.channels() as u32
    }

    fn standby(&mut self) -> AudioResult<()> {
        Ok(())
    }

    fn set_parameters(&mut self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }
}
