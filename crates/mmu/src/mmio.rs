//! MMIO windows.
//!
//! Device registers are mapped into a kernel region that only ever grows;
//! windows are never unmapped or reused.

use crate::{
    Cpu, Mmu, PageFlags, PhysicalAddress, VirtualAddress, arch::PAGE_SIZE,
    human_size::HumanSize,
};

/// Uncached, kernel-only, writable.
const MMIO_FLAGS: PageFlags = PageFlags::WRITABLE
    .union(PageFlags::NO_CACHE)
    .union(PageFlags::WRITE_THROUGH);

pub struct MmioWindows {
    next: spin::Mutex<VirtualAddress>,
}

impl MmioWindows {
    pub(crate) const fn new(base: VirtualAddress) -> Self {
        Self {
            next: spin::Mutex::new(base),
        }
    }

    /// Maps `size` bytes of device memory at `physical` and returns the window's address.
    ///
    /// # Panics
    /// Panics if `size` is not a page multiple or `physical` is not page-aligned.
    pub(crate) fn map(
        &self,
        mmu: &Mmu,
        cpu: &Cpu,
        physical: PhysicalAddress,
        size: usize,
    ) -> VirtualAddress {
        if !size.is_multiple_of(PAGE_SIZE) {
            log::error!("MMIO window of {size:#x} bytes at {physical} is not a page multiple");
            panic!("MMIO windows must be a whole number of pages");
        }

        let mut next = self.next.lock();
        let start = *next;
        let kernel = mmu.kernel_directory();
        for offset in (0..size).step_by(PAGE_SIZE) {
            let address = start + offset;
            let Some(entry) = kernel.entry(address, true) else {
                log::error!("MMIO page {address} lies inside a large page");
                panic!("MMIO window overlaps a large page");
            };
            kernel.map_to_physical(entry, physical + offset, MMIO_FLAGS);
            mmu.invalidate(cpu, address);
        }
        *next = start + size;

        log::debug!("mapped {} of MMIO at {physical} to {start}", HumanSize(size));
        start
    }
}
