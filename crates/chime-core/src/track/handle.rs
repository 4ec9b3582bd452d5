//! Client-side track handles
//!
//! A handle owns the producing end of the shared block and a control
//! sender into the owning thread. Control calls are request/ack: the
//! thread applies them under its own lock at the top of its loop and
//! answers on the request's reply channel, so no client ever holds a
//! thread lock. Dropping a handle sends a fire-and-forget destroy; the
//! thread removes the track outside its mix loop.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Sender};

use crate::cblk::{flags, BlockConsumer, BlockProducer, TrackShared};
use crate::error::{AudioError, AudioResult};
use crate::thread::ThreadMsg;
use crate::track::TrackEvent;

/// Control requests a client can send to a track's owning thread
#[derive(Debug, Clone, Copy)]
pub enum TrackOp {
    Lifecycle(TrackEvent),
    SetVolume { left: i32, right: i32 },
    Mute(bool),
    /// Remove the track entirely; sent on handle drop, never acked
    Destroy,
}

pub struct TrackRequest {
    pub track_id: usize,
    pub op: TrackOp,
    pub ack: Option<Sender<AudioResult<()>>>,
}

/// How long a client waits for the owning thread to ack a control call
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

fn send_op(control: &Sender<ThreadMsg>, track_id: usize, op: TrackOp) -> AudioResult<()> {
    let (ack_tx, ack_rx) = bounded(1);
    control
        .send(ThreadMsg::Track(TrackRequest {
            track_id,
            op,
            ack: Some(ack_tx),
        }))
        .map_err(|_| AudioError::InvalidOperation("owning thread is gone".into()))?;
    match ack_rx.recv_timeout(CONTROL_TIMEOUT) {
        Ok(result) => result,
        Err(_) => Err(AudioError::TimedOut("track control")),
    }
}

/// Client endpoint of a playback track
pub struct TrackHandle {
    track_id: usize,
    shared: Arc<TrackShared>,
    producer: BlockProducer,
    control: Sender<ThreadMsg>,
}

impl TrackHandle {
    pub(crate) fn new(
        track_id: usize,
        shared: Arc<TrackShared>,
        producer: BlockProducer,
        control: Sender<ThreadMsg>,
    ) -> Self {
        Self {
            track_id,
            shared,
            producer,
            control,
        }
    }

    pub fn id(&self) -> usize {
        self.track_id
    }

    pub fn start(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Start))
    }

    pub fn stop(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Stop))
    }

    pub fn pause(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Pause))
    }

    pub fn flush(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Flush))
    }

    pub fn mute(&self, muted: bool) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Mute(muted))
    }

    /// Per-track gain in 4.12, composed with master and stream-type
    /// gain by the mix loop
    pub fn set_volume(&self, left: i32, right: i32) -> AudioResult<()> {
        send_op(
            &self.control,
            self.track_id,
            TrackOp::SetVolume { left, right },
        )
    }

    /// Blocking write of PCM frames, waiting up to `timeout` for space
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> AudioResult<usize> {
        self.producer.write(data, timeout)
    }

    pub fn frames_available(&self) -> usize {
        self.shared.frames_available()
    }

    /// Time a full ring represents at the track's current rate; the
    /// longest a well-behaved write can block before space must appear
    pub fn buffer_duration(&self) -> Duration {
        let rate = self.shared.sample_rate().max(1) as u64;
        Duration::from_nanos(self.shared.frame_count() as u64 * 1_000_000_000 / rate)
    }

    /// Retune a live track. The owning thread picks the new rate up at
    /// the start of its next mix cycle; data already queued is played at
    /// the new rate. Capped at twice the output rate, checked there.
    pub fn set_sample_rate(&self, rate: u32) -> AudioResult<()> {
        if rate == 0 {
            return Err(AudioError::BadValue("sample rate 0".into()));
        }
        self.shared.set_sample_rate(rate);
        Ok(())
    }

    /// Loop a statically prefilled region. `count < 0` repeats forever.
    pub fn set_loop(&self, start: u64, end: u64, count: i32) -> AudioResult<()> {
        self.shared.set_loop(start, end, count)
    }

    /// True once if the track was evicted for underrunning since the
    /// last call; a restart clears the condition
    pub fn take_disabled(&self) -> bool {
        self.shared.clear_flags(flags::UNDERRUN_DISABLED) & flags::UNDERRUN_DISABLED != 0
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        // Unblock the mix loop if it is mid-ramp on our data, then ask
        // for removal. Best effort: a dead thread already removed us.
        self.shared.raise_flags(flags::INVALID);
        let _ = self.control.send(ThreadMsg::Track(TrackRequest {
            track_id: self.track_id,
            op: TrackOp::Destroy,
            ack: None,
        }));
    }
}

/// Client endpoint of a record track
pub struct RecordHandle {
    track_id: usize,
    shared: Arc<TrackShared>,
    consumer: BlockConsumer,
    control: Sender<ThreadMsg>,
}

impl RecordHandle {
    pub(crate) fn new(
        track_id: usize,
        shared: Arc<TrackShared>,
        consumer: BlockConsumer,
        control: Sender<ThreadMsg>,
    ) -> Self {
        Self {
            track_id,
            shared,
            consumer,
            control,
        }
    }

    pub fn id(&self) -> usize {
        self.track_id
    }

    pub fn start(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Start))
    }

    pub fn stop(&self) -> AudioResult<()> {
        send_op(&self.control, self.track_id, TrackOp::Lifecycle(TrackEvent::Stop))
    }

    /// Blocking read of captured PCM
    pub fn read(&mut self, data: &mut [u8], timeout: Duration) -> AudioResult<usize> {
        self.consumer.read(data, timeout)
    }

    /// True once if capture overflowed since the last call
    pub fn take_overflow(&self) -> bool {
        self.shared.clear_flags(flags::OVERFLOW) & flags::OVERFLOW != 0
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        self.shared.raise_flags(flags::INVALID);
        let _ = self.control.send(ThreadMsg::Track(TrackRequest {
            track_id: self.track_id,
            op: TrackOp::Destroy,
            ack: None,
        }));
    }
}
