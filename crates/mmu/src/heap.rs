//! Kernel heap break.
//!
//! The heap is a bump region in the kernel half. Growth maps fresh frames page
//! by page behind the break; nothing is ever returned.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    Cpu, Mmu, PageFlags, VirtualAddress, arch::PAGE_SIZE, human_size::HumanSize,
};

pub struct KernelHeap {
    brk: AtomicUsize,
    limit: usize,
    lock: spin::Mutex<()>,
}

impl KernelHeap {
    pub(crate) const fn new(start: VirtualAddress, limit: usize) -> Self {
        Self {
            brk: AtomicUsize::new(start.as_usize()),
            limit,
            lock: spin::Mutex::new(()),
        }
    }

    /// Returns the current break.
    pub fn current_break(&self) -> VirtualAddress {
        VirtualAddress::new(self.brk.load(Ordering::Acquire))
    }

    /// Maps `bytes` more of heap and returns the previous break.
    ///
    /// # Panics
    /// Panics if `bytes` is not a page multiple or exceeds the growth limit.
    pub(crate) fn grow(&self, mmu: &Mmu, cpu: &Cpu, bytes: usize) -> VirtualAddress {
        if bytes == 0 {
            return self.current_break();
        }
        if !bytes.is_multiple_of(PAGE_SIZE) {
            log::error!("heap growth of {bytes:#x} bytes is not a page multiple");
            panic!("kernel heap must grow by whole pages");
        }
        if bytes > self.limit {
            log::error!(
                "heap growth of {} exceeds the {} limit",
                HumanSize(bytes),
                HumanSize(self.limit)
            );
            panic!("kernel heap growth request too large");
        }

        let _guard = self.lock.lock();
        let start = self.current_break();
        let kernel = mmu.kernel_directory();
        for offset in (0..bytes).step_by(PAGE_SIZE) {
            let address = start + offset;
            let Some(entry) = kernel.entry(address, true) else {
                log::error!("kernel heap page {address} lies inside a large page");
                panic!("kernel heap overlaps a large page");
            };
            kernel.set_frame(entry, None, PageFlags::WRITABLE);
            mmu.invalidate(cpu, address);
        }
        self.brk.store((start + bytes).as_usize(), Ordering::Release);

        log::debug!("kernel heap grew by {} to {}", HumanSize(bytes), start + bytes);
        start
    }
}
