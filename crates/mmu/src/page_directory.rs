//! Page table walking.
//!
//! A [`PageDirectory`] is a view of one address space's table tree. Tables are
//! frames owned by the physical memory manager and reached through the
//! address translator, so the same walker runs against the kernel's direct map
//! and against emulated memory.

use core::fmt;

use crate::{
    FrameNumber, PhysicalAddress, PhysicalMemoryManager, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags, PageTable, TOP_LEVEL},
    human_size::HumanSize,
};

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// The entry at `level` was not present; 3 is the root table, 0 the leaf.
    NotMapped { level: usize },
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped { level } => write!(f, "no mapping at page table level {level}"),
        }
    }
}

impl core::error::Error for TranslateError {}

/// Size of a page mapped directly by one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    /// Returns the table level whose entries map pages of this size.
    pub const fn level(self) -> usize {
        match self {
            Self::Size4KiB => 0,
            Self::Size2MiB => 1,
            Self::Size1GiB => 2,
        }
    }

    pub const fn bytes(self) -> usize {
        arch::level_span(self.level())
    }
}

/// A view of the table tree rooted at one top-level frame.
pub struct PageDirectory<'a> {
    root: FrameNumber,
    memory: &'a AddressTranslator,
    frames: &'a PhysicalMemoryManager,
}

impl<'a> PageDirectory<'a> {
    pub(crate) fn new(
        root: FrameNumber,
        memory: &'a AddressTranslator,
        frames: &'a PhysicalMemoryManager,
    ) -> Self {
        Self {
            root,
            memory,
            frames,
        }
    }

    /// Returns the frame holding the top-level table.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    pub(crate) fn memory(&self) -> &'a AddressTranslator {
        self.memory
    }

    pub(crate) fn frames(&self) -> &'a PhysicalMemoryManager {
        self.frames
    }

    /// Views `frame` as a page table.
    ///
    /// # Safety
    /// `frame` must hold a page table of this tree, and the caller must not
    /// create overlapping mutable views of it. Mutation of one address space
    /// is serialized by its owner.
    pub(crate) unsafe fn table(&self, frame: FrameNumber) -> &'a mut PageTable {
        // SAFETY: Caller guarantees frame holds a table; tables fill their frame exactly
        unsafe { &mut *self.memory.frame_ptr::<PageTable>(frame) }
    }

    /// Allocates a zero-filled frame for a new table.
    pub(crate) fn allocate_table(&self) -> FrameNumber {
        let frame = self.frames.allocate();
        self.memory.zero_frame(frame);
        frame
    }

    /// Resolves `address` to the physical address it maps.
    ///
    /// Read-only: never allocates. Large pages resolve with the offset inside
    /// the large page.
    pub fn translate(&self, address: VirtualAddress) -> Result<PhysicalAddress, TranslateError> {
        // SAFETY: root is the top-level table of this tree
        let mut table = unsafe { self.table(self.root) };
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry(address.page_index(level));
            let next = entry.address().ok_or(TranslateError::NotMapped { level })?;
            if arch::supports_large_pages(level) && entry.is_large() {
                let offset = address.as_usize() & (arch::level_span(level) - 1);
                return Ok(next + offset);
            }
            // SAFETY: a present non-leaf entry links a table of this tree
            table = unsafe { self.table(next.frame_number()) };
        }

        let entry = table.entry(address.page_index(0));
        let page = entry
            .address()
            .ok_or(TranslateError::NotMapped { level: 0 })?;
        Ok(page + address.page_offset())
    }

    /// Returns the leaf entry for `address`.
    ///
    /// With `create`, missing intermediate tables are allocated zero-filled and
    /// linked as user-accessible; without, the walk stops at the first missing
    /// level. Walking into a large page returns None.
    pub(crate) fn entry(&self, address: VirtualAddress, create: bool) -> Option<&'a mut PageEntry> {
        self.walk(address, 0, create)
    }

    /// Walks down to the entry for `address` at `target_level`.
    fn walk(
        &self,
        address: VirtualAddress,
        target_level: usize,
        create: bool,
    ) -> Option<&'a mut PageEntry> {
        // SAFETY: root is the top-level table of this tree
        let mut table = unsafe { self.table(self.root) };
        for level in (target_level + 1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(address.page_index(level));
            if !entry.is_present() {
                if !create {
                    log::trace!("{address} has no table below level {level}");
                    return None;
                }
                if level == TOP_LEVEL && !address.is_lower_half() {
                    log::warn!(
                        "creating kernel root entry for {address} after initialization; \
                         existing address spaces will not see it"
                    );
                }
                let frame = self.allocate_table();
                *entry = PageEntry::new(frame.start(), PageFlags::USER_TABLE);
            } else if arch::supports_large_pages(level) && entry.is_large() {
                log::warn!(
                    "tried to get a level {target_level} entry for {address} inside a {} page",
                    HumanSize(arch::level_span(level))
                );
                return None;
            }
            let next = entry.raw_frame();
            // SAFETY: a present non-leaf entry links a table of this tree
            table = unsafe { self.table(next) };
        }

        Some(table.entry_mut(address.page_index(target_level)))
    }

    /// Installs a 4 KiB leaf mapping in `entry`.
    ///
    /// With `Some(frame)` that frame is mapped. With `None` the frame already
    /// recorded in the entry is kept; if there is none a fresh zero-filled frame
    /// is allocated.
    ///
    /// # Panics
    /// Panics if `flags` asks for a large page.
    pub(crate) fn set_frame(&self, entry: &mut PageEntry, frame: Option<FrameNumber>, flags: PageFlags) {
        if flags.is_large() {
            log::error!("large page flag passed for a 4 KiB mapping: {flags:?}");
            panic!("large pages can only be mapped with map_large");
        }

        let frame = match frame {
            Some(frame) => frame,
            None if entry.raw_frame().as_usize() != 0 => entry.raw_frame(),
            None => {
                let frame = self.frames.allocate();
                self.memory.zero_frame(frame);
                frame
            }
        };
        *entry = PageEntry::new(frame.start(), flags | PageFlags::PRESENT);
    }

    /// Maps `entry` to the frame containing `physical`, recording that frame as used.
    ///
    /// # Panics
    /// Panics if `physical` is not page-aligned.
    pub(crate) fn map_to_physical(&self, entry: &mut PageEntry, physical: PhysicalAddress, flags: PageFlags) {
        if !physical.is_page_aligned() {
            log::error!("cannot map unaligned physical address {physical}");
            panic!("physical address must be page-aligned");
        }
        self.frames.mark_used(physical);
        self.set_frame(entry, Some(physical.frame_number()), flags);
    }

    /// Maps a single large page at `address`.
    ///
    /// Intermediate tables are created as needed. Large pages are kernel-only.
    ///
    /// # Panics
    /// Panics if `size` is 4 KiB, either address is not aligned to `size`, the
    /// flags include user access, or a table already occupies the slot.
    pub(crate) fn map_large(
        &self,
        address: VirtualAddress,
        physical: PhysicalAddress,
        size: PageSize,
        flags: PageFlags,
    ) {
        assert!(
            size != PageSize::Size4KiB,
            "map_large needs a 2 MiB or 1 GiB page size"
        );
        assert!(
            address.is_aligned(size.bytes()) && physical.is_aligned(size.bytes()),
            "large page addresses must be aligned to the page size"
        );
        if flags.is_user() {
            log::error!("refusing user large page at {address}");
            panic!("large pages are kernel-only");
        }

        let Some(entry) = self.walk(address, size.level(), true) else {
            log::error!("{address} is already covered by a larger page");
            panic!("large page overlaps an existing large page");
        };
        if entry.is_present() && !entry.is_large() {
            log::error!("{address} already has a page table at level {}", size.level());
            panic!("large page would replace a page table");
        }
        *entry = PageEntry::new(physical, flags | PageFlags::PRESENT | PageFlags::LARGE);
        log::debug!("mapped {} page {address} -> {physical}", HumanSize(size.bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameBitmap, arch::PAGE_SIZE};

    struct Harness {
        memory: AddressTranslator,
        frames: PhysicalMemoryManager,
        root: FrameNumber,
    }

    impl Harness {
        fn directory(&self) -> PageDirectory<'_> {
            PageDirectory::new(self.root, &self.memory, &self.frames)
        }
    }

    fn setup(frame_count: usize) -> Harness {
        let storage = vec![0u64; FrameBitmap::words_for(frame_count)].leak();
        let mut bitmap = FrameBitmap::new(storage, frame_count);
        bitmap.release_range(PhysicalAddress::new(PAGE_SIZE), (frame_count - 1) * PAGE_SIZE);
        let memory = AddressTranslator::emulated(frame_count * PAGE_SIZE);
        let frames = PhysicalMemoryManager::new(bitmap);
        let root = frames.allocate();
        Harness {
            memory,
            frames,
            root,
        }
    }

    mod translate {
        use super::*;

        #[test]
        fn empty_tree_reports_top_level() {
            let harness = setup(16);
            let directory = harness.directory();
            assert_eq!(
                directory.translate(VirtualAddress::new(0x40_0000)),
                Err(TranslateError::NotMapped { level: 3 })
            );
        }

        #[test]
        fn round_trip_with_offset() {
            let harness = setup(32);
            let directory = harness.directory();
            let address = VirtualAddress::new(0x7f_0000_3000);
            let entry = directory.entry(address, true).unwrap();
            directory.set_frame(entry, Some(FrameNumber::new(20)), PageFlags::WRITABLE);

            assert_eq!(
                directory.translate(address + 0x123),
                Ok(PhysicalAddress::new(20 * PAGE_SIZE + 0x123))
            );
        }

        #[test]
        fn reports_missing_leaf_level() {
            let harness = setup(32);
            let directory = harness.directory();
            directory.entry(VirtualAddress::new(0x5000), true).unwrap();
            assert_eq!(
                directory.translate(VirtualAddress::new(0x5000)),
                Err(TranslateError::NotMapped { level: 0 })
            );
            assert_eq!(
                directory.translate(VirtualAddress::new(0x20_0000)),
                Err(TranslateError::NotMapped { level: 1 })
            );
        }

        #[test]
        fn never_allocates() {
            let harness = setup(16);
            let used = harness.frames.used_frames();
            harness
                .directory()
                .translate(VirtualAddress::new(0x1234_5000))
                .unwrap_err();
            assert_eq!(harness.frames.used_frames(), used);
        }

        #[test]
        fn error_display() {
            let error = TranslateError::NotMapped { level: 2 };
            assert_eq!(error.to_string(), "no mapping at page table level 2");
        }
    }

    mod entry {
        use super::*;

        #[test]
        fn create_allocates_zeroed_user_tables() {
            let harness = setup(16);
            let directory = harness.directory();
            let before = harness.frames.used_frames();
            directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            assert_eq!(harness.frames.used_frames(), before + 3);

            // SAFETY: root holds the tree's top-level table
            let root = unsafe { directory.table(harness.root) };
            let link = root.entry(0);
            assert_eq!(link.flags(), PageFlags::USER_TABLE);
            // SAFETY: link points at a table just created by the walk
            let child = unsafe { directory.table(link.raw_frame()) };
            assert_eq!(child.present_entries().count(), 1);
        }

        #[test]
        fn create_is_idempotent() {
            let harness = setup(16);
            let directory = harness.directory();
            directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            let used = harness.frames.used_frames();
            directory.entry(VirtualAddress::new(0x2000), true).unwrap();
            assert_eq!(harness.frames.used_frames(), used);
        }

        #[test]
        fn lookup_without_create() {
            let harness = setup(16);
            let directory = harness.directory();
            assert!(directory.entry(VirtualAddress::new(0x1000), false).is_none());
            directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            let entry = directory.entry(VirtualAddress::new(0x1000), false).unwrap();
            assert!(!entry.is_present());
        }

        #[test]
        fn refuses_to_descend_through_large_page() {
            let harness = setup(16);
            let directory = harness.directory();
            directory.map_large(
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x4000_0000),
                PageSize::Size2MiB,
                PageFlags::WRITABLE,
            );
            let used = harness.frames.used_frames();
            assert!(directory.entry(VirtualAddress::new(0x20_1000), true).is_none());
            assert_eq!(harness.frames.used_frames(), used);
        }
    }

    mod set_frame {
        use super::*;

        #[test]
        fn allocates_when_entry_is_empty() {
            let harness = setup(16);
            let directory = harness.directory();
            let entry = directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            directory.set_frame(entry, None, PageFlags::WRITABLE | PageFlags::USER);

            let frame = entry.frame().unwrap();
            assert!(harness.frames.is_used(frame.start()));
            assert!(entry.flags().is_writable());
            assert!(entry.is_user());
        }

        #[test]
        fn keeps_a_reserved_frame() {
            let harness = setup(16);
            let directory = harness.directory();
            let entry = directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            *entry = PageEntry::new(FrameNumber::new(9).start(), PageFlags::empty());
            directory.set_frame(entry, None, PageFlags::WRITABLE);
            assert_eq!(entry.frame(), Some(FrameNumber::new(9)));
        }

        #[test]
        #[should_panic(expected = "large pages can only be mapped with map_large")]
        fn rejects_large_flag() {
            let harness = setup(16);
            let directory = harness.directory();
            let entry = directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            directory.set_frame(entry, None, PageFlags::LARGE);
        }

        #[test]
        fn map_to_physical_marks_frame_used() {
            let harness = setup(16);
            let directory = harness.directory();
            let entry = directory.entry(VirtualAddress::new(0x1000), true).unwrap();
            let physical = FrameNumber::new(12).start();
            assert!(!harness.frames.is_used(physical));
            directory.map_to_physical(entry, physical, PageFlags::NO_CACHE);
            assert!(harness.frames.is_used(physical));
            assert_eq!(entry.address(), Some(physical));
        }
    }

    mod large_pages {
        use super::*;

        #[test]
        fn translate_honours_2mib_pages() {
            let harness = setup(16);
            let directory = harness.directory();
            directory.map_large(
                VirtualAddress::new(0xffff_ff80_0020_0000),
                PhysicalAddress::new(0x20_0000),
                PageSize::Size2MiB,
                PageFlags::WRITABLE,
            );
            assert_eq!(
                directory.translate(VirtualAddress::new(0xffff_ff80_0031_2345)),
                Ok(PhysicalAddress::new(0x31_2345))
            );
        }

        #[test]
        fn translate_honours_1gib_pages() {
            let harness = setup(16);
            let directory = harness.directory();
            directory.map_large(
                VirtualAddress::new(0xffff_ff80_4000_0000),
                PhysicalAddress::new(0x4000_0000),
                PageSize::Size1GiB,
                PageFlags::WRITABLE,
            );
            assert_eq!(
                directory.translate(VirtualAddress::new(0xffff_ff80_7fff_fff0)),
                Ok(PhysicalAddress::new(0x7fff_fff0))
            );
        }

        #[test]
        #[should_panic(expected = "large pages are kernel-only")]
        fn rejects_user_large_pages() {
            let harness = setup(16);
            harness.directory().map_large(
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x20_0000),
                PageSize::Size2MiB,
                PageFlags::USER,
            );
        }

        #[test]
        #[should_panic(expected = "aligned to the page size")]
        fn rejects_misaligned() {
            let harness = setup(16);
            harness.directory().map_large(
                VirtualAddress::new(0x21_0000),
                PhysicalAddress::new(0x20_0000),
                PageSize::Size2MiB,
                PageFlags::WRITABLE,
            );
        }

        #[test]
        #[should_panic(expected = "large page would replace a page table")]
        fn rejects_replacing_a_table() {
            let harness = setup(16);
            let directory = harness.directory();
            directory.entry(VirtualAddress::new(0x20_0000), true).unwrap();
            directory.map_large(
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x20_0000),
                PageSize::Size2MiB,
                PageFlags::WRITABLE,
            );
        }
    }
}
