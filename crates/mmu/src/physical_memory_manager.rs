//! Physical memory manager.
//!
//! Serializes every claim and release of physical frames behind one lock over
//! the frame bitmap. The lock is taken per operation and never held while a
//! page table is being walked, so walks that allocate cannot deadlock on it.

use crate::{FrameBitmap, FrameNumber, PhysicalAddress, arch::PAGE_SIZE};

/// Snapshot of physical memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes of RAM available to the kernel after boot reservations.
    pub total_bytes: usize,
    /// Bytes of that RAM currently allocated.
    pub used_bytes: usize,
}

pub struct PhysicalMemoryManager {
    bitmap: spin::Mutex<FrameBitmap>,
    /// Frames already used when the manager took over the bitmap.
    reserved_at_boot: usize,
}

impl PhysicalMemoryManager {
    pub fn new(bitmap: FrameBitmap) -> Self {
        let reserved_at_boot = bitmap.used_frames();
        Self {
            bitmap: spin::Mutex::new(bitmap),
            reserved_at_boot,
        }
    }

    /// Claims the lowest free frame.
    ///
    /// # Panics
    /// Panics if physical memory is exhausted.
    pub fn allocate(&self) -> FrameNumber {
        let mut bitmap = self.bitmap.lock();
        let frame = bitmap.first_free();
        bitmap.mark_used(frame.start());
        log::trace!("allocated frame {frame}");
        frame
    }

    /// Claims `count` physically contiguous frames and returns the first.
    ///
    /// # Panics
    /// Panics if no run of `count` free frames exists.
    pub fn allocate_contiguous(&self, count: usize) -> FrameNumber {
        let mut bitmap = self.bitmap.lock();
        let first = bitmap.first_free_n(count);
        for frame in first..first + count {
            bitmap.mark_used(frame.start());
        }
        log::trace!("allocated frames {first}..{}", first + count);
        first
    }

    /// Returns `frame` to the free pool.
    pub fn release(&self, frame: FrameNumber) {
        self.bitmap.lock().mark_free(frame.start());
        log::trace!("released frame {frame}");
    }

    /// Records the frame containing `address` as used, e.g. before mapping device memory.
    pub fn mark_used(&self, address: PhysicalAddress) {
        self.bitmap.lock().mark_used(address);
    }

    pub fn mark_free(&self, address: PhysicalAddress) {
        self.bitmap.lock().mark_free(address);
    }

    pub fn is_used(&self, address: PhysicalAddress) -> bool {
        self.bitmap.lock().test_used(address)
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.lock().frame_count()
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.lock().free_frames()
    }

    pub fn used_frames(&self) -> usize {
        self.bitmap.lock().used_frames()
    }

    pub fn stats(&self) -> MemoryStats {
        let bitmap = self.bitmap.lock();
        let usable = bitmap.frame_count() - self.reserved_at_boot;
        let used = bitmap.used_frames().saturating_sub(self.reserved_at_boot);
        MemoryStats {
            total_bytes: usable * PAGE_SIZE,
            used_bytes: used * PAGE_SIZE,
        }
    }
}
