//! Machine-wide physical frame accounting.
//!
//! Exactly one `FrameAllocator` exists; every address space (kernel and
//! per-process) borrows it for the duration of a call, which is what keeps a
//! physical frame from ever backing two mappings at once.

use crate::memory::bitmap::{PageBitmap, NO_INDEX};
use crate::memory::MemoryError;

pub struct FrameAllocator {
    /// true = frame available. Starts all-unavailable; boot memory map
    /// processing opens up the usable ranges.
    avail: PageBitmap,
    free_frames: usize,
}

impl FrameAllocator {
    pub fn new(total_frames: usize) -> Self {
        Self {
            avail: PageBitmap::new(total_frames, false),
            free_frames: 0,
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn is_free(&self, frame: usize) -> bool {
        self.avail.get(frame)
    }

    /// Claims the lowest-numbered free frame.
    pub fn alloc(&mut self) -> Result<usize, MemoryError> {
        let frame = self.avail.next_true(0);
        if frame == NO_INDEX {
            return Err(MemoryError::OutOfPhysicalFrames);
        }
        self.avail.set(frame, false);
        self.free_frames -= 1;
        Ok(frame)
    }

    /// Returns a frame to the pool.
    pub fn free(&mut self, frame: usize) {
        if !self.avail.get(frame) {
            self.avail.set(frame, true);
            self.free_frames += 1;
        }
    }

    /// Claims a specific frame (identity mapping at boot). Harmless if the
    /// frame was never marked free.
    pub fn mark_used(&mut self, frame: usize) {
        if self.avail.get(frame) {
            self.avail.set(frame, false);
            self.free_frames -= 1;
        }
    }

    /// Opens `[start, end)` up for allocation.
    pub fn mark_free_range(&mut self, start: usize, end: usize) -> Result<(), MemoryError> {
        for frame in start..end.min(self.avail.capacity()) {
            self.free(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_takes_lowest_free_frame() {
        let mut frames = FrameAllocator::new(64);
        frames.mark_free_range(8, 16).unwrap();
        assert_eq!(frames.alloc(), Ok(8));
        assert_eq!(frames.alloc(), Ok(9));
        assert_eq!(frames.free_frames(), 6);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut frames = FrameAllocator::new(16);
        frames.mark_free_range(0, 2).unwrap();
        frames.alloc().unwrap();
        frames.alloc().unwrap();
        assert_eq!(frames.alloc(), Err(MemoryError::OutOfPhysicalFrames));
    }

    #[test]
    fn free_and_mark_used_keep_the_count_straight() {
        let mut frames = FrameAllocator::new(16);
        frames.mark_free_range(0, 4).unwrap();
        let f = frames.alloc().unwrap();
        frames.free(f);
        frames.free(f); // double free is a no-op
        assert_eq!(frames.free_frames(), 4);
        frames.mark_used(f);
        frames.mark_used(f);
        assert_eq!(frames.free_frames(), 3);
    }
}
