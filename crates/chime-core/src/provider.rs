//! Buffer provider interfaces between tracks and the mixing engine
//!
//! A playback track exposes itself to the mixer/resampler as an
//! [`AudioBufferProvider`]: the engine pulls a contiguous run of frames,
//! consumes some or all of it, and releases exactly what it consumed.
//! The capture path is the mirror image: the record thread asks a
//! [`SinkBufferProvider`] for writable space and releases what it filled.
//!
//! Providers return `None` when nothing is available right now; callers
//! treat that as a transient condition, never an error.

/// Pull-side provider: yields readable frames
pub trait AudioBufferProvider: Send {
    /// Next contiguous run of readable bytes, at most `max_frames` frames.
    /// Returns `None` when no data is ready.
    fn get_next_buffer(&mut self, max_frames: usize) -> Option<&[u8]>;

    /// Consume `frames` frames of the run obtained by the last
    /// `get_next_buffer` call. `frames` may be less than what was handed
    /// out; the remainder stays available.
    fn release_buffer(&mut self, frames: usize);

    /// Bytes per frame of the data this provider yields
    fn frame_size(&self) -> usize;
}

/// Push-side provider: yields writable space
pub trait SinkBufferProvider: Send {
    /// Next contiguous run of writable bytes, at most `max_frames` frames.
    /// Returns `None` when the consumer has not drained any space.
    fn get_sink_buffer(&mut self, max_frames: usize) -> Option<&mut [u8]>;

    /// Publish `frames` frames written into the run obtained by the last
    /// `get_sink_buffer` call.
    fn release_sink(&mut self, frames: usize);

    /// Bytes per frame of the data this sink accepts
    fn frame_size(&self) -> usize;
}

/// Provider over an in-memory byte buffer
///
/// Used by the record thread to resample out of its hardware staging
/// buffer, and by tests as a canned track source.
pub struct MemoryProvider {
    data: Vec<u8>,
    pos: usize,
    frame_size: usize,
}

impl MemoryProvider {
    pub fn new(data: Vec<u8>, frame_size: usize) -> Self {
        Self { data, pos: 0, frame_size }
    }

    /// Frames not yet consumed
    pub fn frames_left(&self) -> usize {
        (self.data.len() - self.pos) / self.frame_size
    }

    /// Rewind and replace the contents
    pub fn reload(&mut self, data: Vec<u8>) {
        self.data = data;
        self.pos = 0;
    }

    /// Rewind without replacing the contents
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl AudioBufferProvider for MemoryProvider {
    fn get_next_buffer(&mut self, max_frames: usize) -> Option<&[u8]> {
        let left = self.frames_left();
        if left == 0 || max_frames == 0 {
            return None;
        }
        let run = left.min(max_frames) * self.frame_size;
        Some(&self.data[self.pos..self.pos + run])
    }

    fn release_buffer(&mut self, frames: usize) {
        self.pos = (self.pos + frames * self.frame_size).min(self.data.len());
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Provider that never has data; stands in for a stalled client
pub struct EmptyProvider {
    frame_size: usize,
}

impl EmptyProvider {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl AudioBufferProvider for EmptyProvider {
    fn get_next_buffer(&mut self, _max_frames: usize) -> Option<&[u8]> {
        None
    }

    fn release_buffer(&mut self, _frames: usize) {}

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_provider_partial_release() {
        let data: Vec<u8> = (0..16).collect();
        let mut p = MemoryProvider::new(data, 4);
        assert_eq!(p.frames_left(), 4);

        let buf = p.get_next_buffer(2).unwrap();
        assert_eq!(buf.len(), 8);
        p.release_buffer(1);
        assert_eq!(p.frames_left(), 3);

        // Unreleased frames come back on the next pull
        let buf = p.get_next_buffer(8).unwrap();
        assert_eq!(buf[0], 4);
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_memory_provider_exhaustion() {
        let mut p = MemoryProvider::new(vec![0u8; 8], 4);
        p.release_buffer(2);
        assert!(p.get_next_buffer(1).is_none());
    }

    #[test]
    fn test_empty_provider() {
        let mut p = EmptyProvider::new(4);
        assert!(p.get_next_buffer(128).is_none());
        assert_eq!(p.frame_size(), 4);
    }
}
