//! The memory manager: sole owner of physical frames and page tables.

use crate::{
    AddressSpace, AddressTranslator, Cpu, FrameBitmap, FrameNumber, KernelHeap, MemoryLayout,
    MemoryStats, MmioWindows, PageDirectory, PageEntry, PageFlags, PageSize, PhysicalAddress,
    PhysicalMemoryManager, TranslateError, UserAccess, VirtualAddress,
    arch::{PAGE_SIZE, TOP_LEVEL},
    human_size::HumanSize,
};

pub struct Mmu {
    memory: AddressTranslator,
    frames: PhysicalMemoryManager,
    layout: MemoryLayout,
    kernel: AddressSpace,
    heap: KernelHeap,
    mmio: MmioWindows,
}

impl Mmu {
    /// Creates the memory manager with a fresh, empty kernel address space.
    ///
    /// Frame 0 is reserved. The kernel root gets tables for the heap, MMIO and
    /// direct-map regions up front so every address space cloned from it sees
    /// later kernel mappings.
    pub fn new(memory: AddressTranslator, mut bitmap: FrameBitmap, layout: MemoryLayout) -> Self {
        layout.validate();
        bitmap.mark_used(PhysicalAddress::new(0));
        let frames = PhysicalMemoryManager::new(bitmap);
        let root = frames.allocate();
        memory.zero_frame(root);
        Self::assemble(memory, frames, layout, root)
    }

    /// Creates the memory manager around an existing top-level table, such as
    /// the one the bootloader left active.
    ///
    /// # Safety
    /// `root` must hold a valid top-level table reachable through `memory`,
    /// and every table frame beneath it must already be marked used in `bitmap`.
    pub unsafe fn with_kernel_root(
        memory: AddressTranslator,
        mut bitmap: FrameBitmap,
        layout: MemoryLayout,
        root: PhysicalAddress,
    ) -> Self {
        layout.validate();
        assert!(root.is_page_aligned(), "kernel root table must be page-aligned");
        bitmap.mark_used(PhysicalAddress::new(0));
        bitmap.mark_used(root);
        let frames = PhysicalMemoryManager::new(bitmap);
        Self::assemble(memory, frames, layout, root.frame_number())
    }

    /// Creates a memory manager over `frame_count` frames of emulated memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(frame_count: usize) -> Self {
        let storage = alloc::vec![0u64; FrameBitmap::words_for(frame_count)].leak();
        let mut bitmap = FrameBitmap::new(storage, frame_count);
        bitmap.release_range(PhysicalAddress::new(0), frame_count * PAGE_SIZE);
        Self::new(
            AddressTranslator::emulated(frame_count * PAGE_SIZE),
            bitmap,
            MemoryLayout::default(),
        )
    }

    fn assemble(
        memory: AddressTranslator,
        frames: PhysicalMemoryManager,
        layout: MemoryLayout,
        root: FrameNumber,
    ) -> Self {
        let mmu = Self {
            heap: KernelHeap::new(layout.kernel_heap_start, layout.heap_grow_limit),
            mmio: MmioWindows::new(layout.mmio_base),
            kernel: AddressSpace::from_root(root),
            memory,
            frames,
            layout,
        };
        mmu.populate_kernel_half();

        let stats = mmu.memory_stats();
        log::info!(
            "memory manager ready: kernel root at {}, {} of {} in use",
            root.start(),
            HumanSize(stats.used_bytes),
            HumanSize(stats.total_bytes)
        );
        mmu
    }

    fn populate_kernel_half(&self) {
        let kernel = self.kernel_directory();
        // SAFETY: the kernel root holds a top-level table and nothing else views it yet
        let root = unsafe { kernel.table(self.kernel.root()) };
        for region in self.layout.kernel_regions() {
            let entry = root.entry_mut(region.page_index(TOP_LEVEL));
            if !entry.is_present() {
                let table = kernel.allocate_table();
                *entry = PageEntry::new(table.start(), PageFlags::KERNEL_TABLE);
                log::debug!("created kernel root entry for {region}");
            }
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn memory(&self) -> &AddressTranslator {
        &self.memory
    }

    pub fn frames(&self) -> &PhysicalMemoryManager {
        &self.frames
    }

    /// Returns the kernel's initial address space.
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    /// Creates the context for the CPU with `id`, with the kernel space active.
    pub fn cpu(&self, id: usize) -> Cpu {
        Cpu::new(id, self.kernel.root())
    }

    pub(crate) fn directory(&self, space: &AddressSpace) -> PageDirectory<'_> {
        PageDirectory::new(space.root(), &self.memory, &self.frames)
    }

    pub(crate) fn kernel_directory(&self) -> PageDirectory<'_> {
        self.directory(&self.kernel)
    }

    /// Claims one free frame.
    ///
    /// # Panics
    /// Panics if physical memory is exhausted.
    pub fn frame_allocate(&self) -> FrameNumber {
        self.frames.allocate()
    }

    /// Claims `count` physically contiguous frames and returns the first.
    ///
    /// # Panics
    /// Panics if no such run exists.
    pub fn frame_allocate_n(&self, count: usize) -> FrameNumber {
        self.frames.allocate_contiguous(count)
    }

    pub fn frame_release(&self, frame: FrameNumber) {
        self.frames.release(frame);
    }

    /// Maps `entry` to the frame at `physical` and records that frame as used.
    pub fn frame_map_to_physical(
        &self,
        entry: &mut PageEntry,
        physical: PhysicalAddress,
        flags: PageFlags,
    ) {
        self.kernel_directory().map_to_physical(entry, physical, flags);
    }

    /// Resolves `address` in `space`.
    pub fn translate(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        self.directory(space).translate(address)
    }

    /// Returns the leaf entry for `address` in `space`, creating missing tables if `create`.
    ///
    /// Only the lower half is reachable: upper-half tables are shared by every
    /// space and are changed through the heap and MMIO operations instead.
    pub fn get_entry<'s>(
        &'s self,
        space: &'s mut AddressSpace,
        address: VirtualAddress,
        create: bool,
    ) -> Option<&'s mut PageEntry> {
        if !address.is_lower_half() {
            log::warn!("refusing entry for kernel address {address} in {space:?}");
            return None;
        }
        self.directory(space).entry(address, create)
    }

    /// Installs a 4 KiB mapping in `entry`.
    ///
    /// `None` keeps the frame already in the entry, or maps a fresh zero-filled one.
    pub fn set_frame(&self, entry: &mut PageEntry, frame: Option<FrameNumber>, flags: PageFlags) {
        self.kernel_directory().set_frame(entry, frame, flags);
    }

    /// Flushes the cached translation of `address` on `cpu`.
    pub fn invalidate(&self, cpu: &Cpu, address: VirtualAddress) {
        self.memory.flush(cpu.id(), address);
    }

    /// Maps a large page in the kernel space. Only used while bringing up the kernel.
    pub fn map_large(
        &self,
        address: VirtualAddress,
        physical: PhysicalAddress,
        size: PageSize,
        flags: PageFlags,
    ) {
        self.kernel_directory().map_large(address, physical, size, flags);
    }

    /// Creates a new address space from `source`, or from the kernel space if None.
    ///
    /// The kernel half is shared with the source; user pages are copied,
    /// kernel-only pages are shared and the excluded range is left empty.
    pub fn address_space_clone(&self, source: Option<&AddressSpace>) -> AddressSpace {
        let source = source.unwrap_or(&self.kernel);
        let space = self.directory(source).clone_space(&self.layout);
        log::debug!("cloned {source:?} into {space:?}");
        space
    }

    /// Destroys `space`, releasing its user pages and page tables.
    ///
    /// # Panics
    /// Panics if asked to free the kernel's initial space.
    pub fn address_space_free(&self, space: Option<AddressSpace>) {
        let Some(space) = space else {
            log::warn!("asked to free a missing address space");
            return;
        };
        if space.root() == self.kernel.root() {
            log::error!("refusing to free the kernel address space {space:?}");
            panic!("cannot free the kernel address space");
        }
        self.directory(&space).free_space(&self.layout);
        log::debug!("freed {space:?}");
    }

    /// Makes `space`, or the kernel space if None, active on `cpu`.
    ///
    /// # Safety
    /// `space` must not be freed while it is active on any CPU.
    pub unsafe fn address_space_set_active(&self, cpu: &Cpu, space: Option<&AddressSpace>) {
        let root = space.unwrap_or(&self.kernel).root();
        cpu.set_active_root(root);
        // SAFETY: every space shares the kernel half of the kernel root, so it maps the kernel
        unsafe { self.memory.load_root(cpu.id(), root.start()) };
    }

    /// Counts the page tables and user pages `space` owns outside the excluded range.
    pub fn count_user_pages(&self, space: &AddressSpace) -> usize {
        self.directory(space).count_user_pages(&self.layout)
    }

    /// Counts the user pages `space` maps in the shared-memory range.
    pub fn count_shared_pages(&self, space: &AddressSpace) -> usize {
        self.directory(space).count_shared_pages(&self.layout)
    }

    /// Unmaps every user page touching `address..address + size` and flushes each on `cpu`.
    ///
    /// Pages in the excluded range and kernel-only pages are left alone.
    pub fn unmap_user(
        &self,
        cpu: &Cpu,
        space: &mut AddressSpace,
        address: VirtualAddress,
        size: usize,
    ) {
        let directory = self.directory(space);
        let start = address.align_down(PAGE_SIZE).as_usize();
        let end = address.as_usize().saturating_add(size);
        let mut unmapped = 0;
        for page in (start..end).step_by(PAGE_SIZE) {
            let page = VirtualAddress::new(page);
            if directory.unmap_user_page(page, &self.layout) {
                self.invalidate(cpu, page);
                unmapped += 1;
            }
        }
        log::debug!("unmapped {unmapped} user pages from {space:?} at {address}");
    }

    /// Returns true if user mode may access `size` bytes at `address` in `space`.
    pub fn validate_user_pointer(
        &self,
        space: &AddressSpace,
        address: usize,
        size: usize,
        access: UserAccess,
    ) -> bool {
        self.directory(space).validate_user_range(address, size, access)
    }

    /// Grows the kernel heap by `bytes` and returns the previous break.
    ///
    /// `heap_grow(cpu, 0)` returns the current break without locking.
    ///
    /// # Panics
    /// Panics if `bytes` is not a page multiple or exceeds the layout's growth limit.
    pub fn heap_grow(&self, cpu: &Cpu, bytes: usize) -> VirtualAddress {
        self.heap.grow(self, cpu, bytes)
    }

    pub fn heap_break(&self) -> VirtualAddress {
        self.heap.current_break()
    }

    /// Maps `size` bytes of device memory at `physical` into a new MMIO window.
    ///
    /// # Panics
    /// Panics if `size` is not a page multiple.
    pub fn mmio_map(&self, cpu: &Cpu, physical: PhysicalAddress, size: usize) -> VirtualAddress {
        self.mmio.map(self, cpu, physical, size)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.frames.stats()
    }
}
