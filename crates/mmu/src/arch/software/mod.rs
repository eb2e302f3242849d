//! Software emulation for testing and development.
//!
//! Physical memory is a page-aligned host allocation, and the TLB is replaced by
//! a log of the flushes and root loads each CPU performed. Page tables keep the
//! real x86_64 encoding, so everything above this module runs unchanged on a
//! host while tests observe the invalidations it issues.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
    vec::Vec,
};
use core::ptr::NonNull;

use crate::{PhysicalAddress, VirtualAddress};

use super::PAGE_SIZE;

/// A translation-state change recorded by emulated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbEvent {
    /// A single page was invalidated on `cpu`.
    Flush { cpu: usize, address: VirtualAddress },
    /// A new root table was loaded on `cpu`.
    LoadRoot { cpu: usize, root: PhysicalAddress },
}

/// Emulated memory for software simulation.
///
/// Physical address `n` is byte `n` of the backing buffer.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
    events: spin::Mutex<Vec<TlbEvent>>,
}

// SAFETY: The buffer is owned exclusively by this value and only reached through
// raw pointers handed out by `translate`; synchronising those accesses is the
// responsibility of the page table code, exactly as with real memory.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zero-filled emulated memory region of the specified size.
    ///
    /// # Panics
    /// Panics if `size` is zero or not a multiple of the page size.
    pub fn new(size: usize) -> Self {
        assert!(
            size > 0 && size.is_multiple_of(PAGE_SIZE),
            "emulated memory must be a non-zero multiple of the page size"
        );
        let layout = Self::layout(size);
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout));

        Self {
            base,
            size,
            events: spin::Mutex::new(Vec::new()),
        }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE_SIZE).expect("emulated memory size overflows")
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    /// Panics if the address lies outside the emulated memory.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: phys is within the allocation
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn record(&self, event: TlbEvent) {
        self.events.lock().push(event);
    }

    /// Returns every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<TlbEvent> {
        self.events.lock().clone()
    }

    /// Returns the addresses flushed on `cpu`, oldest first.
    pub fn flushes(&self, cpu: usize) -> Vec<VirtualAddress> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match *event {
                TlbEvent::Flush { cpu: c, address } if c == cpu => Some(address),
                _ => None,
            })
            .collect()
    }

    /// Returns the root most recently loaded on `cpu`.
    pub fn loaded_root(&self, cpu: usize) -> Option<PhysicalAddress> {
        self.events
            .lock()
            .iter()
            .rev()
            .find_map(|event| match *event {
                TlbEvent::LoadRoot { cpu: c, root } if c == cpu => Some(root),
                _ => None,
            })
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: base was allocated in `new` with the same layout
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}
