//! Proxy endpoints over a shared control block
//!
//! [`BlockProducer`] is the filling side (a playback client, or the
//! server capture thread on a record block). [`BlockConsumer`] is the
//! draining side (the mixer, or a record client). Each endpoint owns its
//! cursor exclusively; the peer's cursor is only ever loaded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cblk::{flags, TrackShared};
use crate::error::{AudioError, AudioResult};
use crate::provider::{AudioBufferProvider, SinkBufferProvider};

/// Filling endpoint of a shared block
pub struct BlockProducer {
    shared: Arc<TrackShared>,
    /// Frames handed out by the last `get_sink_buffer`, not yet published
    sink_obtained: usize,
}

impl BlockProducer {
    pub(super) fn new(shared: Arc<TrackShared>) -> Self {
        Self {
            shared,
            sink_obtained: 0,
        }
    }

    pub fn shared(&self) -> &Arc<TrackShared> {
        &self.shared
    }

    /// Copy `data` into the ring, waiting up to `timeout` for space.
    ///
    /// Returns the number of frames written, which is short when the wait
    /// budget runs out mid-transfer. A timeout before *any* frame was
    /// written is an error so callers can distinguish a stalled server
    /// from a slow one. `data.len()` must be frame-aligned.
    pub fn write(&mut self, data: &[u8], timeout: Duration) -> AudioResult<usize> {
        let frame_size = self.shared.frame_size();
        if data.len() % frame_size != 0 {
            return Err(AudioError::BadValue(format!(
                "write of {} bytes not a multiple of frame size {}",
                data.len(),
                frame_size
            )));
        }
        let total = data.len() / frame_size;
        let deadline = Instant::now() + timeout;
        let cblk = self.shared.region.control();

        let mut written = 0;
        while written < total {
            let avail = match self.wait_for_space(deadline) {
                Ok(n) => n,
                Err(AudioError::TimedOut(_)) if written > 0 => break,
                Err(e) => return Err(e),
            };
            let user = cblk.user();
            let want = (total - written).min(avail);
            let dst = self.shared.region.frames_at_mut(user, want);
            let run = dst.len() / frame_size;
            let src = &data[written * frame_size..(written + run) * frame_size];
            dst[..src.len()].copy_from_slice(src);
            cblk.advance_user(run as u64);
            self.shared.sync.data.notify_one();
            written += run;
        }
        Ok(written)
    }

    /// Block until at least one frame of space exists or `deadline`
    /// passes. Returns 0 on deadline only when some earlier progress was
    /// made; a stone-cold timeout is `TimedOut`.
    fn wait_for_space(&self, deadline: Instant) -> AudioResult<usize> {
        let mut avail = self.shared.frames_available();
        if avail > 0 {
            return Ok(avail);
        }
        let mut guard = self.shared.sync.lock.lock().unwrap();
        loop {
            avail = self.shared.frames_available();
            if avail > 0 {
                return Ok(avail);
            }
            if self.shared.flags() & flags::INVALID != 0 {
                return Err(AudioError::InvalidOperation(
                    "control block invalidated".into(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AudioError::TimedOut("obtain_buffer"));
            }
            let (next, timed_out) = self
                .shared
                .sync
                .space
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = next;
            if timed_out.timed_out() && self.shared.frames_available() == 0 {
                return Err(AudioError::TimedOut("obtain_buffer"));
            }
        }
    }
}

// The record path fills the block from the server side without blocking:
// no space means overflow, handled by the caller.
impl SinkBufferProvider for BlockProducer {
    fn get_sink_buffer(&mut self, max_frames: usize) -> Option<&mut [u8]> {
        let avail = self.shared.frames_available().min(max_frames);
        if avail == 0 {
            return None;
        }
        let user = self.shared.region.control().user();
        let buf = self.shared.region.frames_at_mut(user, avail);
        self.sink_obtained = buf.len() / self.shared.frame_size();
        Some(buf)
    }

    fn release_sink(&mut self, frames: usize) {
        debug_assert!(frames <= self.sink_obtained);
        self.sink_obtained = 0;
        if frames == 0 {
            return;
        }
        self.shared.region.control().advance_user(frames as u64);
        self.shared.sync.data.notify_one();
    }

    fn frame_size(&self) -> usize {
        self.shared.frame_size()
    }
}

/// Draining endpoint of a shared block
pub struct BlockConsumer {
    shared: Arc<TrackShared>,
    /// Frames handed out by the last `get_next_buffer`, not yet released
    obtained: usize,
    /// Frames from a failed `step_server`, retried before the next read
    pending_step: usize,
    /// Reset epoch last observed; a mismatch drops any parked step
    generation: u32,
}

impl BlockConsumer {
    pub(super) fn new(shared: Arc<TrackShared>) -> Self {
        let generation = shared.region.control().generation();
        Self {
            shared,
            obtained: 0,
            pending_step: 0,
            generation,
        }
    }

    pub fn shared(&self) -> &Arc<TrackShared> {
        &self.shared
    }

    /// Advance the read cursor by `frames`, honoring an active loop
    /// region: reaching the loop end rewinds to the loop start and spends
    /// one iteration.
    ///
    /// Never blocks: the sync lock is only tried, and on contention the
    /// step is parked in `pending_step` with `STEPSERVER_FAILED` raised,
    /// to be retried on the next consumer call. Returns whether the
    /// cursor actually moved now.
    ///
    /// A reset between the park and the retry discards the step: the
    /// frames it counted were wiped with the cursors, and replaying it
    /// would push the read cursor past the write cursor.
    pub fn step_server(&mut self, frames: usize) -> bool {
        if frames + self.pending_step == 0 {
            return true;
        }
        let cblk = self.shared.region.control();
        let guard = match self.shared.sync.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.pending_step += frames;
                cblk.raise_flags(flags::STEPSERVER_FAILED);
                return false;
            }
        };
        let generation = cblk.generation();
        let frames = if generation == self.generation {
            frames + self.pending_step
        } else {
            self.generation = generation;
            0
        };
        self.pending_step = 0;
        cblk.clear_flags(flags::STEPSERVER_FAILED);
        if frames == 0 {
            drop(guard);
            self.shared.sync.space.notify_one();
            return true;
        }

        let server = cblk.server();
        if let Some((start, end)) = cblk.active_loop(server) {
            let stepped = server + frames as u64;
            if stepped >= end {
                cblk.take_loop_iteration();
                cblk.rewind_server_to(start);
            } else {
                cblk.advance_server(frames as u64);
            }
        } else {
            cblk.advance_server(frames as u64);
        }
        drop(guard);
        self.shared.sync.space.notify_one();
        true
    }

    /// Copy up to `out.len()` bytes from the ring, waiting up to
    /// `timeout` for the first frame. Record clients drain with this.
    pub fn read(&mut self, out: &mut [u8], timeout: Duration) -> AudioResult<usize> {
        let frame_size = self.shared.frame_size();
        let want = out.len() / frame_size;
        if want == 0 {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut read = 0;
        while read < want {
            // A step parked by lock contention must land before more
            // frames are served, or the same bytes would come back twice.
            if self.pending_step > 0 && !self.step_server(0) {
                if Instant::now() >= deadline {
                    if read > 0 {
                        break;
                    }
                    return Err(AudioError::TimedOut("read"));
                }
                std::thread::yield_now();
                continue;
            }
            let ready = match self.wait_for_data(deadline) {
                Ok(n) => n,
                Err(AudioError::TimedOut(_)) if read > 0 => break,
                Err(e) => return Err(e),
            };
            let server = self.shared.region.control().server();
            let src = self.shared.region.frames_at(server, ready.min(want - read));
            let run = src.len() / frame_size;
            out[read * frame_size..read * frame_size + src.len()].copy_from_slice(src);
            read += run;
            self.step_server(run);
        }
        Ok(read)
    }

    fn wait_for_data(&self, deadline: Instant) -> AudioResult<usize> {
        let ready = self.shared.frames_ready();
        if ready > 0 {
            return Ok(ready);
        }
        let mut guard = self.shared.sync.lock.lock().unwrap();
        loop {
            let ready = self.shared.frames_ready();
            if ready > 0 {
                return Ok(ready);
            }
            if self.shared.flags() & flags::INVALID != 0 {
                return Err(AudioError::InvalidOperation(
                    "control block invalidated".into(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AudioError::TimedOut("read"));
            }
            guard = self
                .shared
                .sync
                .data
                .wait_timeout(guard, deadline - now)
                .unwrap()
                .0;
        }
    }
}

impl AudioBufferProvider for BlockConsumer {
    fn get_next_buffer(&mut self, max_frames: usize) -> Option<&[u8]> {
        // A step parked by lock contention must land before the cursor is
        // read, or the same frames would be served twice.
        if self.pending_step > 0 && !self.step_server(0) {
            return None;
        }
        let ready = self.shared.frames_ready().min(max_frames);
        if ready == 0 {
            return None;
        }
        let server = self.shared.region.control().server();
        let buf = self.shared.region.frames_at(server, ready);
        self.obtained = buf.len() / self.shared.frame_size();
        Some(buf)
    }

    fn release_buffer(&mut self, frames: usize) {
        debug_assert!(frames <= self.obtained);
        self.obtained = 0;
        self.step_server(frames);
    }

    fn frame_size(&self) -> usize {
        self.shared.frame_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cblk::new_shared_block;
    use std::thread;

    #[test]
    fn test_blocking_write_wakes_on_drain() {
        let (mut producer, mut consumer) = new_shared_block(4, 2, 44100).unwrap();
        producer.write(&[0u8; 8], Duration::ZERO).unwrap();

        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let n = {
                let buf = consumer.get_next_buffer(2).unwrap();
                buf.len() / 2
            };
            consumer.release_buffer(n);
            consumer
        });

        // Full ring: this parks until the drainer frees two frames
        let written = producer.write(&[1u8; 4], Duration::from_secs(2)).unwrap();
        assert_eq!(written, 2);
        drainer.join().unwrap();
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let (mut producer, mut consumer) = new_shared_block(8, 2, 44100).unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.write(&[9u8; 8], Duration::ZERO).unwrap();
        });
        let mut out = [0u8; 8];
        let read = consumer.read(&mut out, Duration::from_secs(2)).unwrap();
        assert_eq!(read, 4);
        assert_eq!(out, [9u8; 8]);
        writer.join().unwrap();
    }

    #[test]
    fn test_reset_discards_parked_step() {
        let (mut producer, mut consumer) = new_shared_block(8, 2, 44100).unwrap();
        producer.write(&[5u8; 16], Duration::ZERO).unwrap();
        let n = {
            let buf = consumer.get_next_buffer(4).unwrap();
            buf.len() / 2
        };
        // Contend the sync lock so the release parks its step
        let shared = Arc::clone(consumer.shared());
        {
            let _guard = shared.sync.lock.lock().unwrap();
            consumer.release_buffer(n);
        }
        assert_ne!(shared.flags() & flags::STEPSERVER_FAILED, 0);

        shared.reset();
        // The parked step counted frames the reset wiped; replaying it
        // would move the read cursor ahead of the write cursor
        assert!(consumer.get_next_buffer(8).is_none());
        let cblk = shared.region.control();
        assert_eq!(cblk.server(), 0);
        assert_eq!(cblk.user(), 0);
    }

    #[test]
    fn test_read_settles_parked_step_first() {
        let (mut producer, mut consumer) = new_shared_block(8, 2, 44100).unwrap();
        let bytes: Vec<u8> = (0u8..16).collect();
        producer.write(&bytes, Duration::ZERO).unwrap();
        let n = {
            let buf = consumer.get_next_buffer(4).unwrap();
            buf.len() / 2
        };
        let shared = Arc::clone(consumer.shared());
        {
            let _guard = shared.sync.lock.lock().unwrap();
            consumer.release_buffer(n);
        }
        // The next read must land the parked step and return the frames
        // after it, not the four frames already consumed
        let mut out = [0u8; 8];
        let read = consumer.read(&mut out, Duration::from_secs(2)).unwrap();
        assert_eq!(read, 4);
        assert_eq!(out, bytes[8..16]);
    }

    #[test]
    fn test_unaligned_write_rejected() {
        let (mut producer, _consumer) = new_shared_block(8, 4, 44100).unwrap();
        assert!(matches!(
            producer.write(&[0u8; 6], Duration::ZERO),
            Err(AudioError::BadValue(_))
        ));
    }

    #[test]
    fn test_invalidated_block_fails_waiters() {
        let (mut producer, consumer) = new_shared_block(2, 2, 44100).unwrap();
        producer.write(&[0u8; 4], Duration::ZERO).unwrap();
        consumer.shared().raise_flags(flags::INVALID);
        // Space will never come; the waiter must fail fast, not time out
        let err = producer
            .write(&[0u8; 2], Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidOperation(_)));
    }
}
