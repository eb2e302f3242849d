//! Fixed virtual memory layout shared by every address space.

use core::ops::Range;

use crate::{VirtualAddress, arch};

/// Where the kernel places its regions, and which user ranges are managed elsewhere.
///
/// The default is the layout used by the x86_64 kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Initial break of the kernel heap.
    pub kernel_heap_start: VirtualAddress,
    /// Largest single heap growth request.
    pub heap_grow_limit: usize,
    /// First address handed out for MMIO windows.
    pub mmio_base: VirtualAddress,
    /// Start of the direct map of physical memory.
    pub direct_map_base: VirtualAddress,
    /// User range whose leaves are owned by device and shared-memory bookkeeping.
    ///
    /// Clone, free and user page counts skip leaves in this range.
    pub excluded: Range<VirtualAddress>,
    /// User range holding shared-memory mappings; lies inside `excluded`.
    pub shared_memory: Range<VirtualAddress>,
}

impl MemoryLayout {
    pub const X86_64: Self = Self {
        kernel_heap_start: VirtualAddress::new(0xffff_ff00_0000_0000),
        heap_grow_limit: 0x1F0_0000,
        mmio_base: VirtualAddress::new(0xffff_ff1f_c000_0000),
        direct_map_base: VirtualAddress::new(0xffff_ff80_0000_0000),
        excluded: VirtualAddress::new(0x1_0000_0000)..VirtualAddress::new(0x4_0000_0000),
        shared_memory: VirtualAddress::new(0x2_0000_0000)..VirtualAddress::new(0x4_0000_0000),
    };

    /// Returns true if the leaf mapping `address` is left alone by clone and free.
    pub fn is_excluded(&self, address: VirtualAddress) -> bool {
        self.excluded.contains(&address)
    }

    /// Returns true if `span` bytes starting at `base` all lie in the excluded range.
    pub fn excludes_span(&self, base: VirtualAddress, span: usize) -> bool {
        base >= self.excluded.start
            && base.as_usize().saturating_add(span) <= self.excluded.end.as_usize()
    }

    pub fn is_shared_memory(&self, address: VirtualAddress) -> bool {
        self.shared_memory.contains(&address)
    }

    /// Root table entries the kernel owns from initialization onward.
    pub(crate) fn kernel_regions(&self) -> [VirtualAddress; 3] {
        [self.kernel_heap_start, self.mmio_base, self.direct_map_base]
    }

    /// Checks the invariants the rest of the crate relies on.
    ///
    /// # Panics
    /// Panics with a description of the first violated invariant.
    pub fn validate(&self) {
        for region in self.kernel_regions() {
            assert!(
                !region.is_lower_half(),
                "kernel region {region} must be in the upper half"
            );
            assert!(region.is_page_aligned(), "kernel region {region} must be page-aligned");
        }
        assert!(
            self.excluded.end.is_lower_half() && self.excluded.start <= self.excluded.end,
            "excluded range must be a user range"
        );
        assert!(
            self.shared_memory.start >= self.excluded.start
                && self.shared_memory.end <= self.excluded.end,
            "shared memory must lie inside the excluded range"
        );
        assert!(
            self.heap_grow_limit.is_multiple_of(arch::PAGE_SIZE),
            "heap growth limit must be a page multiple"
        );
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let layout = MemoryLayout::default();
        layout.validate();
        assert_eq!(layout.kernel_heap_start.page_index(3), 510);
        assert_eq!(layout.mmio_base.page_index(3), 510);
        assert_eq!(layout.direct_map_base.page_index(3), 511);
    }

    #[test]
    fn excluded_bounds() {
        let layout = MemoryLayout::default();
        assert!(!layout.is_excluded(VirtualAddress::new(0xffff_f000)));
        assert!(layout.is_excluded(VirtualAddress::new(0x1_0000_0000)));
        assert!(layout.is_excluded(VirtualAddress::new(0x3_ffff_f000)));
        assert!(!layout.is_excluded(VirtualAddress::new(0x4_0000_0000)));
    }

    #[test]
    fn spans() {
        let layout = MemoryLayout::default();
        // 1 GiB tables at 4 GiB..7 GiB are wholly excluded
        assert!(layout.excludes_span(VirtualAddress::new(0x1_0000_0000), 0x4000_0000));
        assert!(layout.excludes_span(VirtualAddress::new(0x3_c000_0000), 0x4000_0000));
        // the 512 GiB root entry covering it is not
        assert!(!layout.excludes_span(VirtualAddress::new(0), 0x80_0000_0000));
    }

    #[test]
    fn shared_memory_window() {
        let layout = MemoryLayout::default();
        assert!(layout.is_shared_memory(VirtualAddress::new(0x2_0000_0000)));
        assert!(!layout.is_shared_memory(VirtualAddress::new(0x1_8000_0000)));
    }

    #[test]
    #[should_panic(expected = "must be in the upper half")]
    fn rejects_lower_half_heap() {
        let layout = MemoryLayout {
            kernel_heap_start: VirtualAddress::new(0x4000_0000),
            ..MemoryLayout::default()
        };
        layout.validate();
    }
}
