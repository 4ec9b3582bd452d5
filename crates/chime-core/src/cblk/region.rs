//! Memory-mapped control block region
//!
//! Layout: one cache-line-aligned [`ControlBlock`] header at offset 0,
//! followed immediately by the audio ring (`frame_count * frame_size`
//! bytes). The region is an anonymous shared mapping so that a forked
//! client process sees the same pages; within one process both proxy
//! endpoints simply hold the same `Arc`.

use std::cell::UnsafeCell;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

const CBLK_MAGIC: u32 = 0x43424c4b; // "CBLK"

/// Control block header shared between client and server
///
/// Peer processes read this header directly, so the layout is fixed and
/// every mutable field is an atomic. Geometry fields (`frame_count`,
/// `frame_size`) are written once at allocation; the server side keeps
/// its own snapshot and never trusts re-reads.
#[repr(C, align(64))]
pub struct ControlBlock {
    magic: u32,
    frame_count: u32,
    frame_size: u32,
    sample_rate: AtomicU32,
    /// Producer write cursor in frames, monotonic
    user: AtomicU64,
    /// Consumer read cursor in frames, monotonic
    server: AtomicU64,
    /// Packed per-track gain: left in bits 0..16, right in 16..32, 4.12
    volume_lr: AtomicU32,
    flags: AtomicU32,
    /// Bumped by every reset; consumer proxies compare it to drop steps
    /// that refer to frames a reset discarded
    generation: AtomicU32,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    loop_count: AtomicI32,
}

impl ControlBlock {
    fn init(&mut self, frame_count: usize, frame_size: usize, sample_rate: u32) {
        self.magic = CBLK_MAGIC;
        self.frame_count = frame_count as u32;
        self.frame_size = frame_size as u32;
        self.sample_rate = AtomicU32::new(sample_rate);
        self.user = AtomicU64::new(0);
        self.server = AtomicU64::new(0);
        self.volume_lr = AtomicU32::new(pack_volume(
            crate::types::UNITY_GAIN,
            crate::types::UNITY_GAIN,
        ));
        self.flags = AtomicU32::new(0);
        self.generation = AtomicU32::new(0);
        self.loop_start = AtomicU64::new(0);
        self.loop_end = AtomicU64::new(0);
        self.loop_count = AtomicI32::new(0);
    }

    pub fn user(&self) -> u64 {
        self.user.load(Ordering::Acquire)
    }

    pub fn server(&self) -> u64 {
        self.server.load(Ordering::Acquire)
    }

    /// Publish `frames` newly written frames. Release so the bytes written
    /// before this call are visible once the consumer observes the cursor.
    pub fn advance_user(&self, frames: u64) {
        self.user.fetch_add(frames, Ordering::Release);
    }

    pub fn advance_server(&self, frames: u64) {
        self.server.fetch_add(frames, Ordering::Release);
    }

    pub(super) fn rewind_server_to(&self, frame: u64) {
        self.server.store(frame, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn volume(&self) -> (i32, i32) {
        unpack_volume(self.volume_lr.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, left: i32, right: i32) {
        self.volume_lr
            .store(pack_volume(left, right), Ordering::Relaxed);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn raise_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clear `bits` and return the flags observed before clearing, so
    /// one-shot flags read-and-clear atomically.
    pub fn clear_flags(&self, bits: u32) -> u32 {
        self.flags.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Reset epoch of the block. A consumer proxy that cached a step
    /// under an older epoch must discard it.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_loop(&self, start: u64, end: u64, count: i32) {
        self.loop_start.store(start, Ordering::Relaxed);
        self.loop_end.store(end, Ordering::Relaxed);
        // Count goes last: a consumer that sees it nonzero also sees the
        // bounds stored above.
        self.loop_count.store(count, Ordering::Release);
    }

    /// Active loop bounds if the cursor is inside a live loop region
    pub fn active_loop(&self, server: u64) -> Option<(u64, u64)> {
        if self.loop_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let start = self.loop_start.load(Ordering::Relaxed);
        let end = self.loop_end.load(Ordering::Relaxed);
        if server < end {
            Some((start, end))
        } else {
            None
        }
    }

    /// Spend one loop iteration; returns false when the loop is exhausted.
    /// Negative counts loop forever.
    pub(super) fn take_loop_iteration(&self) -> bool {
        loop {
            let count = self.loop_count.load(Ordering::Acquire);
            match count {
                0 => return false,
                n if n < 0 => return true,
                n => {
                    if self
                        .loop_count
                        .compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return n > 1;
                    }
                }
            }
        }
    }

    pub(super) fn reset(&self) {
        self.user.store(0, Ordering::Release);
        self.server.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        self.loop_count.store(0, Ordering::Release);
        self.loop_start.store(0, Ordering::Relaxed);
        self.loop_end.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }
}

fn pack_volume(left: i32, right: i32) -> u32 {
    ((left as u32) & 0xffff) | (((right as u32) & 0xffff) << 16)
}

fn unpack_volume(packed: u32) -> (i32, i32) {
    ((packed & 0xffff) as i32, (packed >> 16) as i32)
}

/// Anonymous shared mapping holding a [`ControlBlock`] and the audio ring
pub struct SharedRegion {
    mmap: UnsafeCell<MmapMut>,
    frame_count: usize,
    frame_size: usize,
}

// Interior mutation is confined to disjoint ranges: the producer touches
// only frames it owns between server+capacity and user, the consumer only
// frames between server and user, and header fields are atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn allocate(
        frame_count: usize,
        frame_size: usize,
        sample_rate: u32,
    ) -> io::Result<SharedRegion> {
        let len = size_of::<ControlBlock>() + frame_count * frame_size;
        let mmap = MmapOptions::new().len(len).map_anon()?;
        let region = SharedRegion {
            mmap: UnsafeCell::new(mmap),
            frame_count,
            frame_size,
        };
        // Fresh anonymous pages are zeroed, but the header still needs its
        // magic, geometry and unity volume.
        unsafe {
            let header = (*region.mmap.get()).as_mut_ptr() as *mut ControlBlock;
            (*header).init(frame_count, frame_size, sample_rate);
        }
        Ok(region)
    }

    pub fn control(&self) -> &ControlBlock {
        // The header lives at offset 0 for the lifetime of the mapping and
        // init() ran before any handle escaped allocate().
        unsafe { &*((*self.mmap.get()).as_ptr() as *const ControlBlock) }
    }

    /// Borrow `frames` frames of ring bytes starting at absolute frame
    /// cursor `pos`, clamped to the end of the ring (callers handle the
    /// wrapped remainder with a second call). This is the single place
    /// ring offsets are computed and bounds-checked.
    pub fn frames_at(&self, pos: u64, frames: usize) -> &[u8] {
        let (offset, len) = self.span(pos, frames);
        unsafe {
            let base = (*self.mmap.get()).as_ptr().add(size_of::<ControlBlock>());
            std::slice::from_raw_parts(base.add(offset), len)
        }
    }

    /// Mutable variant of [`frames_at`](Self::frames_at). Safe under the
    /// SPSC ownership discipline: only the cursor-owning endpoint maps a
    /// given frame range mutably.
    #[allow(clippy::mut_from_ref)]
    pub fn frames_at_mut(&self, pos: u64, frames: usize) -> &mut [u8] {
        let (offset, len) = self.span(pos, frames);
        unsafe {
            let base = (*self.mmap.get())
                .as_mut_ptr()
                .add(size_of::<ControlBlock>());
            std::slice::from_raw_parts_mut(base.add(offset), len)
        }
    }

    fn span(&self, pos: u64, frames: usize) -> (usize, usize) {
        let index = (pos % self.frame_count as u64) as usize;
        let run = frames.min(self.frame_count - index);
        (index * self.frame_size, run * self.frame_size)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<ControlBlock>(), 64);
        assert_eq!(size_of::<ControlBlock>() % 64, 0);
    }

    #[test]
    fn test_volume_pack_roundtrip() {
        let region = SharedRegion::allocate(8, 4, 48000).unwrap();
        let cblk = region.control();
        cblk.set_volume(0x1000, 0x0800);
        assert_eq!(cblk.volume(), (0x1000, 0x0800));
        cblk.set_volume(0, 0);
        assert_eq!(cblk.volume(), (0, 0));
    }

    #[test]
    fn test_span_clamps_at_wrap() {
        let region = SharedRegion::allocate(8, 4, 44100).unwrap();
        // 6 frames starting at index 6 of an 8-frame ring: only 2 fit
        let run = region.frames_at(6, 6);
        assert_eq!(run.len(), 2 * 4);
        // Absolute cursors beyond one lap land on the same bytes
        let a = region.frames_at(2, 1).as_ptr();
        let b = region.frames_at(10, 1).as_ptr();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reset_bumps_generation() {
        let region = SharedRegion::allocate(8, 4, 44100).unwrap();
        let cblk = region.control();
        let before = cblk.generation();
        cblk.reset();
        assert_ne!(cblk.generation(), before);
    }

    #[test]
    fn test_loop_iteration_countdown() {
        let region = SharedRegion::allocate(8, 4, 44100).unwrap();
        let cblk = region.control();
        cblk.set_loop(0, 4, 2);
        assert!(cblk.take_loop_iteration());
        assert!(!cblk.take_loop_iteration());
        assert!(cblk.active_loop(0).is_none());

        cblk.set_loop(0, 4, -1);
        for _ in 0..16 {
            assert!(cblk.take_loop_iteration());
        }
    }
}
