//! Address space lifecycle.
//!
//! An address space is a top-level table frame and the tree beneath it. The
//! upper half of every top-level table is a copy of the kernel's entries and is
//! never descended into per space; the lower half is private to its owner,
//! apart from the excluded range, whose leaves belong to device and
//! shared-memory bookkeeping elsewhere.

use core::fmt;

use crate::{
    FrameNumber, MemoryLayout, PageDirectory, PhysicalAddress, VirtualAddress,
    arch::{ENTRY_COUNT, KERNEL_HALF_START, PAGE_SIZE, PageEntry, TOP_LEVEL, level_span},
};

/// An address space owned by its creator.
///
/// Not `Clone`: a second handle to the same root could free it twice. Spaces
/// are created with [`Mmu::address_space_clone`](crate::Mmu::address_space_clone)
/// and destroyed with [`Mmu::address_space_free`](crate::Mmu::address_space_free).
pub struct AddressSpace {
    root: FrameNumber,
}

impl AddressSpace {
    pub(crate) const fn from_root(root: FrameNumber) -> Self {
        Self { root }
    }

    /// Returns the frame holding the top-level table.
    pub const fn root(&self) -> FrameNumber {
        self.root
    }

    /// Returns the physical address loaded into the root register to activate this space.
    pub const fn root_address(&self) -> PhysicalAddress {
        self.root.start()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpace({})", self.root.start())
    }
}

/// Access a user pointer must permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccess {
    pub write: bool,
    pub allow_null: bool,
}

impl UserAccess {
    pub const READ: Self = Self {
        write: false,
        allow_null: false,
    };
    pub const WRITE: Self = Self {
        write: true,
        allow_null: false,
    };

    pub const fn or_null(self) -> Self {
        Self {
            allow_null: true,
            ..self
        }
    }
}

impl PageDirectory<'_> {
    /// Builds a new space whose kernel half is this space's and whose user half is a deep copy.
    pub(crate) fn clone_space(&self, layout: &MemoryLayout) -> AddressSpace {
        let root = self.allocate_table();
        // SAFETY: both frames hold top-level tables; root was just allocated
        let (source, target) = unsafe { (self.table(self.root()), self.table(root)) };

        for index in KERNEL_HALF_START..ENTRY_COUNT {
            *target.entry_mut(index) = source.entry(index);
        }

        for (index, entry) in source.present_entries() {
            if index >= KERNEL_HALF_START {
                break;
            }
            let base = VirtualAddress::new(index * level_span(TOP_LEVEL));
            if let Some(cloned) = self.clone_entry(entry, TOP_LEVEL, base, layout) {
                *target.entry_mut(index) = cloned;
            }
        }

        AddressSpace::from_root(root)
    }

    /// Produces the entry replacing `entry`, found at `level` and covering `base`, in a clone.
    fn clone_entry(
        &self,
        entry: PageEntry,
        level: usize,
        base: VirtualAddress,
        layout: &MemoryLayout,
    ) -> Option<PageEntry> {
        if layout.excludes_span(base, level_span(level)) {
            return None;
        }

        if level == 0 {
            if !entry.is_user() {
                #[cfg(feature = "detailed-logging")]
                log::trace!("clone: sharing kernel page {base}");
                return Some(entry);
            }
            let frame = self.frames().allocate();
            self.memory().copy_frame(entry.raw_frame(), frame);
            #[cfg(feature = "detailed-logging")]
            log::trace!("clone: copied user page {base} into frame {frame}");
            return Some(PageEntry::new(frame.start(), entry.flags()));
        }

        if entry.is_large() {
            return Some(entry);
        }

        let table = self.allocate_table();
        // SAFETY: entry links a table of this tree; table was just allocated
        let (source, target) = unsafe { (self.table(entry.raw_frame()), self.table(table)) };
        for (index, child) in source.present_entries() {
            let child_base = base + index * level_span(level - 1);
            if let Some(cloned) = self.clone_entry(child, level - 1, child_base, layout) {
                *target.entry_mut(index) = cloned;
            }
        }
        Some(PageEntry::new(table.start(), entry.flags()))
    }

    /// Releases every frame owned by the lower half of this space, then its root.
    pub(crate) fn free_space(&self, layout: &MemoryLayout) {
        // SAFETY: root is the top-level table of this tree
        let root = unsafe { self.table(self.root()) };
        for (index, entry) in root.present_entries() {
            if index >= KERNEL_HALF_START {
                break;
            }
            let base = VirtualAddress::new(index * level_span(TOP_LEVEL));
            self.free_entry(entry, TOP_LEVEL, base, layout);
        }
        self.frames().release(self.root());
    }

    fn free_entry(&self, entry: PageEntry, level: usize, base: VirtualAddress, layout: &MemoryLayout) {
        if level == 0 {
            if entry.is_user() && !layout.is_excluded(base) {
                #[cfg(feature = "detailed-logging")]
                log::trace!("free: releasing user page {base}");
                self.frames().release(entry.raw_frame());
            }
            return;
        }
        if entry.is_large() {
            return;
        }

        // SAFETY: entry links a table of this tree
        let table = unsafe { self.table(entry.raw_frame()) };
        for (index, child) in table.present_entries() {
            self.free_entry(child, level - 1, base + index * level_span(level - 1), layout);
        }
        self.frames().release(entry.raw_frame());
    }

    /// Counts the lower-half table frames and user pages outside the excluded range.
    pub(crate) fn count_user_pages(&self, layout: &MemoryLayout) -> usize {
        self.count_lower_half(true, &|address, entry| {
            entry.is_user() && !layout.is_excluded(address)
        })
    }

    /// Counts the user pages inside the shared-memory range.
    pub(crate) fn count_shared_pages(&self, layout: &MemoryLayout) -> usize {
        self.count_lower_half(false, &|address, entry| {
            entry.is_user() && layout.is_shared_memory(address)
        })
    }

    fn count_lower_half(
        &self,
        count_tables: bool,
        leaf: &dyn Fn(VirtualAddress, PageEntry) -> bool,
    ) -> usize {
        self.count_in(self.root(), TOP_LEVEL, VirtualAddress::new(0), count_tables, leaf)
    }

    fn count_in(
        &self,
        frame: FrameNumber,
        level: usize,
        base: VirtualAddress,
        count_tables: bool,
        leaf: &dyn Fn(VirtualAddress, PageEntry) -> bool,
    ) -> usize {
        // SAFETY: frame is a table of this tree
        let table = unsafe { self.table(frame) };
        let mut count = 0;
        for (index, entry) in table.present_entries() {
            if level == TOP_LEVEL && index >= KERNEL_HALF_START {
                break;
            }
            let address = base + index * level_span(level);
            if level == 0 {
                count += usize::from(leaf(address, entry));
            } else if !entry.is_large() {
                count += usize::from(count_tables);
                count += self.count_in(entry.raw_frame(), level - 1, address, count_tables, leaf);
            }
        }
        count
    }

    /// Unmaps the user page at `address`, releasing its frame and any tables left empty.
    ///
    /// Returns true if a page was unmapped.
    pub(crate) fn unmap_user_page(&self, address: VirtualAddress, layout: &MemoryLayout) -> bool {
        if !address.is_lower_half() || layout.is_excluded(address) {
            return false;
        }
        self.unmap_in(self.root(), TOP_LEVEL, address).is_some()
    }

    /// Returns whether the table at `frame` is empty afterwards, or None if nothing was unmapped.
    fn unmap_in(&self, frame: FrameNumber, level: usize, address: VirtualAddress) -> Option<bool> {
        // SAFETY: frame is a table of this tree
        let table = unsafe { self.table(frame) };
        let entry = table.entry_mut(address.page_index(level));
        if !entry.is_present() {
            return None;
        }

        if level == 0 {
            if !entry.is_user() {
                return None;
            }
            self.frames().release(entry.raw_frame());
            entry.clear();
        } else {
            if entry.is_large() {
                return None;
            }
            let child = entry.raw_frame();
            if self.unmap_in(child, level - 1, address)? {
                entry.clear();
                self.frames().release(child);
                log::trace!("released empty level {} table for {address}", level - 1);
            }
        }
        Some(table.is_unused())
    }

    /// Checks that user mode may access `size` bytes at `address` with `access`.
    pub(crate) fn validate_user_range(&self, address: usize, size: usize, access: UserAccess) -> bool {
        if address == 0 && !access.allow_null {
            return false;
        }
        // an empty range still names the page at `address`
        let Some(last) = address.checked_add(size.saturating_sub(1)) else {
            return false;
        };
        if !VirtualAddress::try_new(last).is_some_and(VirtualAddress::is_lower_half) {
            return false;
        }

        let mut page = address & !(PAGE_SIZE - 1);
        while page <= last {
            let Some(entry) = self.entry(VirtualAddress::new(page), false) else {
                return false;
            };
            let flags = entry.flags();
            if !entry.is_user() || (access.write && !flags.is_writable()) {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }
}
