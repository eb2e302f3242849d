//! Bit-per-frame inventory of physical memory.
//!
//! Bit `n` describes frame `n`; a set bit means the frame is in use. The bitmap
//! records nothing about who owns a frame. Frames beyond the tracked range are
//! treated as permanently used, so device memory above the end of RAM can be
//! "marked" without effect.

use crate::{FrameNumber, PhysicalAddress, arch::PAGE_SIZE, human_size::HumanSize};

/// A region of physical memory reported by the bootloader.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains RAM the kernel may allocate from.
    fn is_usable(&self) -> bool;
}

const BITS_PER_WORD: usize = u64::BITS as usize;

pub struct FrameBitmap {
    words: &'static mut [u64],
    frame_count: usize,
    /// No frame below this index is free.
    lowest_free: usize,
}

impl FrameBitmap {
    /// Returns the number of words of storage needed to track `frame_count` frames.
    pub const fn words_for(frame_count: usize) -> usize {
        frame_count.div_ceil(BITS_PER_WORD)
    }

    /// Creates a bitmap tracking `frame_count` frames, all of them marked used.
    ///
    /// # Panics
    /// Panics if `storage` is too small for `frame_count` frames.
    pub fn new(storage: &'static mut [u64], frame_count: usize) -> Self {
        assert!(
            storage.len() >= Self::words_for(frame_count),
            "frame bitmap storage too small for {frame_count} frames"
        );
        storage.fill(u64::MAX);
        Self {
            words: storage,
            frame_count,
            lowest_free: frame_count,
        }
    }

    /// Builds the inventory from the bootloader's memory map.
    ///
    /// Every frame starts out used; frames wholly inside a usable region are
    /// released. Frame 0 stays reserved so a zero frame field never names an
    /// allocation.
    pub fn from_boot_map<R: BootMemoryRegion>(
        storage: &'static mut [u64],
        frame_count: usize,
        regions: impl IntoIterator<Item = R>,
    ) -> Self {
        let mut bitmap = Self::new(storage, frame_count);
        for region in regions {
            if !region.is_usable() {
                continue;
            }
            log::trace!(
                "usable memory at {} ({})",
                region.base(),
                HumanSize(region.size())
            );
            bitmap.release_range(region.base(), region.size());
        }
        bitmap.mark_used(PhysicalAddress::new(0));
        log::debug!(
            "frame bitmap tracks {} frames, {} free",
            frame_count,
            HumanSize(bitmap.free_frames() * PAGE_SIZE)
        );
        bitmap
    }

    /// Marks every whole frame inside `base..base + size` free.
    pub fn release_range(&mut self, base: PhysicalAddress, size: usize) {
        let first = base.as_usize().div_ceil(PAGE_SIZE);
        let last = (base.as_usize() + size) / PAGE_SIZE;
        for index in first..last.min(self.frame_count) {
            self.clear_bit(index);
        }
    }

    /// Marks every frame touching `base..base + size` used.
    pub fn reserve_range(&mut self, base: PhysicalAddress, size: usize) {
        let first = base.as_usize() / PAGE_SIZE;
        let last = (base.as_usize() + size).div_ceil(PAGE_SIZE);
        for index in first..last.min(self.frame_count) {
            self.set_bit(index);
        }
    }

    /// Returns the number of frames tracked.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Marks the frame containing `frame_addr` used. Out-of-range frames are ignored.
    pub fn mark_used(&mut self, frame_addr: PhysicalAddress) {
        let index = frame_addr.frame_number().as_usize();
        if index < self.frame_count {
            self.set_bit(index);
        }
    }

    /// Marks the frame containing `frame_addr` free. Out-of-range frames are ignored.
    pub fn mark_free(&mut self, frame_addr: PhysicalAddress) {
        let index = frame_addr.frame_number().as_usize();
        if index < self.frame_count {
            self.clear_bit(index);
        }
    }

    /// Returns whether the frame containing `frame_addr` is used.
    ///
    /// Frames outside the tracked range report used.
    pub fn test_used(&self, frame_addr: PhysicalAddress) -> bool {
        let index = frame_addr.frame_number().as_usize();
        index >= self.frame_count || self.bit(index)
    }

    /// Returns the lowest free frame without claiming it.
    ///
    /// # Panics
    /// Panics if every frame is used.
    pub fn first_free(&mut self) -> FrameNumber {
        let start = self.lowest_free / BITS_PER_WORD;
        for word_index in start..self.words_for_count() {
            let word = self.words[word_index];
            if word == u64::MAX {
                continue;
            }
            let index = word_index * BITS_PER_WORD + word.trailing_ones() as usize;
            if index < self.frame_count {
                self.lowest_free = index;
                return FrameNumber::new(index);
            }
        }

        self.lowest_free = self.frame_count;
        log::error!(
            "out of memory: all {} frames in use",
            self.frame_count
        );
        panic!("out of physical memory");
    }

    /// Returns the first frame of the lowest run of `count` free frames without claiming it.
    ///
    /// # Panics
    /// Panics if `count` is zero or no such run exists.
    pub fn first_free_n(&self, count: usize) -> FrameNumber {
        assert!(count > 0, "contiguous allocation of zero frames");

        let mut run_start = self.lowest_free;
        let mut run_length = 0;
        for index in self.lowest_free..self.frame_count {
            if self.bit(index) {
                run_start = index + 1;
                run_length = 0;
                continue;
            }
            run_length += 1;
            if run_length == count {
                return FrameNumber::new(run_start);
            }
        }

        log::error!(
            "failed to allocate {count} contiguous frames ({} free in total)",
            self.free_frames()
        );
        panic!("out of physical memory: no run of {count} contiguous frames");
    }

    pub fn free_frames(&self) -> usize {
        // bits past frame_count are always set
        self.words[..self.words_for_count()]
            .iter()
            .map(|word| word.count_zeros() as usize)
            .sum()
    }

    pub fn used_frames(&self) -> usize {
        self.frame_count - self.free_frames()
    }

    fn words_for_count(&self) -> usize {
        Self::words_for(self.frame_count)
    }

    fn bit(&self, index: usize) -> bool {
        self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.words[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
    }

    fn clear_bit(&mut self, index: usize) {
        self.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
        self.lowest_free = self.lowest_free.min(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(frame_count: usize) -> &'static mut [u64] {
        vec![0u64; FrameBitmap::words_for(frame_count)].leak()
    }

    fn all_free(frame_count: usize) -> FrameBitmap {
        let mut bitmap = FrameBitmap::new(storage(frame_count), frame_count);
        bitmap.release_range(PhysicalAddress::new(0), frame_count * PAGE_SIZE);
        bitmap
    }

    fn frame(index: usize) -> PhysicalAddress {
        FrameNumber::new(index).start()
    }

    struct Region {
        base: usize,
        size: usize,
        usable: bool,
    }

    impl BootMemoryRegion for Region {
        fn base(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.base)
        }

        fn size(&self) -> usize {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    mod marking {
        use super::*;

        #[test]
        fn new_bitmap_is_fully_used() {
            let bitmap = FrameBitmap::new(storage(100), 100);
            assert_eq!(bitmap.free_frames(), 0);
            assert_eq!(bitmap.used_frames(), 100);
        }

        #[test]
        fn mark_used_is_idempotent() {
            let mut bitmap = all_free(64);
            bitmap.mark_used(frame(5));
            bitmap.mark_used(frame(5));
            assert!(bitmap.test_used(frame(5)));
            assert_eq!(bitmap.used_frames(), 1);
        }

        #[test]
        fn mark_free_is_idempotent() {
            let mut bitmap = all_free(64);
            bitmap.mark_used(frame(5));
            bitmap.mark_free(frame(5));
            bitmap.mark_free(frame(5));
            assert!(!bitmap.test_used(frame(5)));
            assert_eq!(bitmap.used_frames(), 0);
        }

        #[test]
        fn addresses_inside_a_frame_name_that_frame() {
            let mut bitmap = all_free(64);
            bitmap.mark_used(PhysicalAddress::new(0x3abc));
            assert!(bitmap.test_used(frame(3)));
        }

        #[test]
        fn out_of_range_ignored_and_reported_used() {
            let mut bitmap = all_free(64);
            bitmap.mark_used(frame(64));
            bitmap.mark_free(frame(1000));
            assert_eq!(bitmap.used_frames(), 0);
            assert!(bitmap.test_used(frame(64)));
            assert!(bitmap.test_used(frame(1000)));
        }
    }

    mod searching {
        use super::*;

        #[test]
        fn first_free_skips_used_words() {
            let mut bitmap = all_free(200);
            for index in 0..130 {
                bitmap.mark_used(frame(index));
            }
            assert_eq!(bitmap.first_free(), FrameNumber::new(130));
        }

        #[test]
        fn first_free_finds_released_lower_frame() {
            let mut bitmap = all_free(16);
            for index in 0..10 {
                bitmap.mark_used(frame(index));
            }
            assert_eq!(bitmap.first_free(), FrameNumber::new(10));
            bitmap.mark_free(frame(4));
            assert_eq!(bitmap.first_free(), FrameNumber::new(4));
        }

        #[test]
        fn first_free_ignores_padding_bits() {
            let mut bitmap = all_free(3);
            for index in 0..3 {
                bitmap.mark_used(frame(index));
            }
            assert_eq!(bitmap.free_frames(), 0);
        }

        #[test]
        #[should_panic(expected = "out of physical memory")]
        fn first_free_exhausted() {
            let mut bitmap = FrameBitmap::new(storage(8), 8);
            bitmap.first_free();
        }

        #[test]
        fn first_free_n_finds_a_run() {
            let mut bitmap = all_free(16);
            bitmap.mark_used(frame(0));
            bitmap.mark_used(frame(3));
            bitmap.mark_used(frame(6));
            assert_eq!(bitmap.first_free_n(2), FrameNumber::new(1));
            assert_eq!(bitmap.first_free_n(3), FrameNumber::new(7));
        }

        #[test]
        fn first_free_n_crosses_word_boundaries() {
            let mut bitmap = all_free(130);
            for index in 0..60 {
                bitmap.mark_used(frame(index));
            }
            assert_eq!(bitmap.first_free_n(10), FrameNumber::new(60));
        }

        #[test]
        #[should_panic(expected = "no run of 4 contiguous frames")]
        fn first_free_n_exhausted() {
            let mut bitmap = all_free(8);
            bitmap.mark_used(frame(2));
            bitmap.mark_used(frame(5));
            bitmap.first_free_n(4);
        }

        #[test]
        #[should_panic(expected = "contiguous allocation of zero frames")]
        fn first_free_n_zero() {
            all_free(8).first_free_n(0);
        }
    }

    mod boot_map {
        use super::*;

        #[test]
        fn releases_usable_regions_only() {
            let regions = [
                Region {
                    base: 0,
                    size: 0x9f000,
                    usable: true,
                },
                Region {
                    base: 0x9f000,
                    size: 0x61000,
                    usable: false,
                },
                Region {
                    base: 0x10_0000,
                    size: 0x10_0000,
                    usable: true,
                },
            ];
            let bitmap = FrameBitmap::from_boot_map(storage(512), 512, regions);

            assert!(bitmap.test_used(frame(0)));
            assert!(!bitmap.test_used(frame(1)));
            assert!(!bitmap.test_used(frame(0x9e)));
            assert!(bitmap.test_used(frame(0x9f)));
            assert!(bitmap.test_used(frame(0xff)));
            assert!(!bitmap.test_used(frame(0x100)));
            assert!(!bitmap.test_used(frame(0x1ff)));
            assert_eq!(bitmap.free_frames(), 0x9e + 0x100);
        }

        #[test]
        fn partial_frames_stay_reserved() {
            let regions = [Region {
                base: 0x1800,
                size: 0x3000,
                usable: true,
            }];
            let bitmap = FrameBitmap::from_boot_map(storage(16), 16, regions);
            assert!(bitmap.test_used(frame(1)));
            assert!(!bitmap.test_used(frame(2)));
            assert!(!bitmap.test_used(frame(3)));
            assert!(bitmap.test_used(frame(4)));
        }

        #[test]
        fn reserve_range_covers_partial_frames() {
            let mut bitmap = all_free(16);
            bitmap.reserve_range(PhysicalAddress::new(0x1800), 0x1000);
            assert!(bitmap.test_used(frame(1)));
            assert!(bitmap.test_used(frame(2)));
            assert!(!bitmap.test_used(frame(3)));
        }
    }
}
