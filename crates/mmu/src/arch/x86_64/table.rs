//! Page table structure for x86_64 architecture.

use super::{PAGE_SIZE, entry::PageEntry};

/// Number of entries in an x86_64 page table.
pub const ENTRY_COUNT: usize = 512;

/// A page table for x86_64 architecture.
///
/// This is the in-memory layout of a single level of the hierarchy: exactly one
/// frame holding 512 entries. Tables are never allocated on the heap; they are
/// frames taken from the physical memory manager and viewed through the
/// address translator.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Creates a new, empty page table.
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::from_raw(0); ENTRY_COUNT],
        }
    }

    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::default());
    }

    /// Returns true if no entry is present.
    pub fn is_unused(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_present())
    }

    /// Iterates over the present entries together with their indices.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageFlags, PhysicalAddress};

    #[test]
    fn new_table_is_unused() {
        let table = PageTable::new();
        assert!(table.is_unused());
        assert_eq!(table.len(), 512);
        assert_eq!(table.present_entries().count(), 0);
    }

    #[test]
    fn present_entries_skips_holes() {
        let mut table = PageTable::new();
        *table.entry_mut(3) = PageEntry::new(PhysicalAddress::new(0x3000), PageFlags::PRESENT);
        *table.entry_mut(511) = PageEntry::new(PhysicalAddress::new(0x9000), PageFlags::PRESENT);
        // reserved but not present
        *table.entry_mut(7) = PageEntry::new(PhysicalAddress::new(0x5000), PageFlags::empty());

        let indices: Vec<usize> = table.present_entries().map(|(index, _)| index).collect();
        assert_eq!(indices, vec![3, 511]);
        assert!(!table.is_unused());

        table.zero();
        assert!(table.is_unused());
        assert_eq!(table.entry(7).as_u64(), 0);
    }

    #[test]
    #[should_panic(expected = "page table index out of bounds")]
    fn index_out_of_bounds() {
        PageTable::new().entry(512);
    }
}
