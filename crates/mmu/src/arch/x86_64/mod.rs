//! x86_64 paging geometry and page table primitives.
//!
//! Levels are numbered from the leaf upward: level 0 is the page table (PT),
//! level 1 the page directory (PD), level 2 the page directory pointer table
//! (PDPT) and level 3 the page map level 4 (PML4).

mod entry;
mod flags;
#[cfg(target_arch = "x86_64")]
mod instructions;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
#[cfg(target_arch = "x86_64")]
pub use instructions::{flush, load_root};
pub use table::{ENTRY_COUNT, PageTable};

/// Maximum number of bits in a physical address on x86_64.
///
/// This is the architectural limit; page table entries carry bits 12-51.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of offset bits below the page number.
pub const PAGE_SHIFT: usize = 12;

/// Number of page table levels in x86_64 (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Level of the root table (PML4).
pub const TOP_LEVEL: usize = PAGE_TABLE_LEVELS - 1;

/// Index of the first root entry belonging to the kernel (upper) half.
pub const KERNEL_HALF_START: usize = ENTRY_COUNT / 2;

/// Returns the page table index for a given virtual address at the specified level.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for x86_64 page table levels"
    );
    let shift = 12 + (level * 9);
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Returns the number of bytes covered by a single entry at `level`.
///
/// A level 0 entry maps one 4 KiB page, level 1 covers 2 MiB, level 2 covers
/// 1 GiB and level 3 covers 512 GiB.
#[inline]
pub const fn level_span(level: usize) -> usize {
    PAGE_SIZE << (9 * level)
}

/// Returns true if an entry at `level` may map a page directly with the large page bit.
#[inline]
pub const fn supports_large_pages(level: usize) -> bool {
    level == 1 || level == 2
}

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for x86_64.
///
/// This sign-extends bit 47 to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Returns true if the canonical address lies in the lower (user) half.
#[inline]
pub const fn is_lower_half(addr: usize) -> bool {
    addr < (1 << (MAX_VIRTUAL_BITS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_index_splits_all_levels() {
        // 0xffff_ff1f_c000_0000: PML4 510, PDPT 127, PD 0, PT 0
        let address = 0xffff_ff1f_c000_0000;
        assert_eq!(page_index(address, 3), 510);
        assert_eq!(page_index(address, 2), 127);
        assert_eq!(page_index(address, 1), 0);
        assert_eq!(page_index(address, 0), 0);

        let address = 0x0000_0000_4060_3000;
        assert_eq!(page_index(address, 3), 0);
        assert_eq!(page_index(address, 2), 1);
        assert_eq!(page_index(address, 1), 3);
        assert_eq!(page_index(address, 0), 3);
    }

    #[test]
    #[should_panic(expected = "level out of range")]
    fn page_index_rejects_fifth_level() {
        page_index(0, 4);
    }

    #[test]
    fn level_spans() {
        assert_eq!(level_span(0), 0x1000);
        assert_eq!(level_span(1), 0x20_0000);
        assert_eq!(level_span(2), 0x4000_0000);
        assert_eq!(level_span(3), 0x80_0000_0000);
    }

    #[test]
    fn large_pages_only_at_middle_levels() {
        assert!(!supports_large_pages(0));
        assert!(supports_large_pages(1));
        assert!(supports_large_pages(2));
        assert!(!supports_large_pages(3));
    }

    #[test]
    fn canonical_addresses() {
        assert!(validate_virtual(0x0000_7fff_ffff_ffff));
        assert!(validate_virtual(0xffff_8000_0000_0000));
        assert!(!validate_virtual(0x0000_8000_0000_0000));
        assert!(!validate_virtual(0xffff_7fff_ffff_ffff));
        assert_eq!(canonicalize_virtual(0x0000_ff80_0000_0000), 0xffff_ff80_0000_0000);
    }

    #[test]
    fn halves() {
        assert!(is_lower_half(0x3_ffff_ffff));
        assert!(!is_lower_half(0xffff_ff00_0000_0000));
    }
}
