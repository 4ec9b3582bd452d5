//! Shared control block: the cross-process track buffer protocol
//!
//! Every track owns one [`SharedRegion`]: a control-block header followed
//! by the audio ring, mapped into both the client and the server process.
//! The header carries two monotonically increasing frame cursors:
//!
//! - `user`: producer write cursor, advanced only by the producing side
//! - `server`: consumer read cursor, advanced only by the consuming side
//!
//! `user - server` is the number of frames ready for the consumer and is
//! always in `[0, frame_count]`. The cursors are 64-bit and never wrap in
//! practice, so `user == server` is unambiguously empty and
//! `user - server == frame_count` unambiguously full — no sequence/index
//! packing is needed to tell wraparound from emptiness.
//!
//! Ordering contract: the producer writes frame bytes *before* advancing
//! `user` (release store); the consumer loads `user` with acquire before
//! touching the bytes, and never consumes past the observed `user`.
//!
//! The consumer side must never block the real-time thread: advancing
//! `server` takes the sync lock with `try_lock` only, records
//! `STEPSERVER_FAILED` on contention and retries next cycle. Blocking
//! bounded waits (a client waiting for space or data) live entirely on
//! the client side.

mod proxy;
mod region;

pub use proxy::{BlockConsumer, BlockProducer};
pub use region::{ControlBlock, SharedRegion};

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{AudioError, AudioResult};

/// Control block flag bits
pub mod flags {
    /// Track was evicted by the mixer after exhausting its retry budget;
    /// the client must restart it explicitly.
    pub const UNDERRUN_DISABLED: u32 = 1 << 0;
    /// Server invalidated the block (route change, thread teardown)
    pub const INVALID: u32 = 1 << 1;
    /// Last `step_server` lost the lock race; the pending step is retried
    /// before the next consumer read.
    pub const STEPSERVER_FAILED: u32 = 1 << 2;
    /// Capture ring overflowed because the client drained too slowly.
    /// One-shot: cleared when the client observes it.
    pub const OVERFLOW: u32 = 1 << 3;
}

/// Blocking-wait rendezvous for one control block
///
/// Cursor state crosses the process boundary through the mapped header;
/// this pair only parks and wakes waiters. `space` is signaled when the
/// consumer frees room, `data` when the producer publishes frames.
pub(crate) struct CblkSync {
    pub lock: Mutex<()>,
    pub space: Condvar,
    pub data: Condvar,
}

impl CblkSync {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            space: Condvar::new(),
            data: Condvar::new(),
        }
    }
}

/// One track's shared state: mapped region plus its wait rendezvous
pub struct TrackShared {
    pub(crate) region: SharedRegion,
    pub(crate) sync: CblkSync,
    frame_count: usize,
    frame_size: usize,
}

impl TrackShared {
    /// Geometry snapshot taken at creation; never re-read from the
    /// client-writable header.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frames ready for the consumer. With an active loop region this is
    /// bounded by the loop end rather than the producer cursor, but never
    /// exceeds what the producer has actually written.
    pub fn frames_ready(&self) -> usize {
        let cblk = self.region.control();
        let server = cblk.server();
        let user = cblk.user();
        let filled = user.saturating_sub(server).min(self.frame_count as u64);
        if let Some((_, end)) = cblk.active_loop(server) {
            return (end - server).min(filled) as usize;
        }
        filled as usize
    }

    /// Frames of free space for the producer
    pub fn frames_available(&self) -> usize {
        let cblk = self.region.control();
        let filled = cblk.user().saturating_sub(cblk.server());
        self.frame_count.saturating_sub(filled as usize)
    }

    /// Requested client sample rate (clients may retune a live track)
    pub fn sample_rate(&self) -> u32 {
        self.region.control().sample_rate()
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.region.control().set_sample_rate(rate);
    }

    /// Per-track volume as packed L/R 4.12
    pub fn volume(&self) -> (i32, i32) {
        self.region.control().volume()
    }

    pub fn set_volume(&self, left: i32, right: i32) {
        self.region.control().set_volume(left, right);
    }

    pub fn raise_flags(&self, bits: u32) {
        self.region.control().raise_flags(bits);
    }

    pub fn clear_flags(&self, bits: u32) -> u32 {
        self.region.control().clear_flags(bits)
    }

    pub fn flags(&self) -> u32 {
        self.region.control().flags()
    }

    /// Configure a loop region for a statically filled buffer.
    /// `count < 0` loops forever; `count == 0` clears the loop.
    pub fn set_loop(&self, start: u64, end: u64, count: i32) -> AudioResult<()> {
        if count != 0 && (start >= end || end > self.frame_count as u64) {
            return Err(AudioError::BadValue(format!(
                "loop [{}, {}) outside buffer of {} frames",
                start, end, self.frame_count
            )));
        }
        self.region.control().set_loop(start, end, count);
        Ok(())
    }

    /// Fail all current and future blocking waiters on this block
    pub fn invalidate(&self) {
        self.region.control().raise_flags(flags::INVALID);
        let _guard = self.sync.lock.lock().unwrap();
        self.sync.space.notify_all();
        self.sync.data.notify_all();
    }

    /// Zero both cursors and all flags. Used on flush/stop; callers
    /// serialize against in-flight consumer steps via the owning thread's
    /// lock, so this takes the sync lock unconditionally.
    pub fn reset(&self) {
        let _guard = self.sync.lock.lock().unwrap();
        self.region.control().reset();
        self.sync.space.notify_all();
    }
}

/// Allocate a shared control block plus audio ring and return the two
/// endpoint proxies. Fails with `NoMemory` if the region cannot be mapped.
pub fn new_shared_block(
    frame_count: usize,
    frame_size: usize,
    sample_rate: u32,
) -> AudioResult<(BlockProducer, BlockConsumer)> {
    if frame_count == 0 || frame_size == 0 || frame_size > 64 {
        return Err(AudioError::BadValue(format!(
            "bad block geometry: {} frames x {} bytes",
            frame_count, frame_size
        )));
    }
    let region = SharedRegion::allocate(frame_count, frame_size, sample_rate).map_err(|e| {
        log::error!("control block allocation failed: {}", e);
        AudioError::NoMemory
    })?;

    let shared = Arc::new(TrackShared {
        region,
        sync: CblkSync::new(),
        frame_count,
        frame_size,
    });

    Ok((
        BlockProducer::new(Arc::clone(&shared)),
        BlockConsumer::new(shared),
    ))
}
