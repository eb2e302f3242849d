//! Page table entry for x86_64 architecture.

use core::fmt;

use crate::{FrameNumber, PhysicalAddress};

use super::flags::PageFlags;

/// A single page table entry for x86_64.
///
/// Entries are 64-bit values holding a frame address in bits 12-51 and flags in
/// the remaining bits. A cleared entry is all zeroes. The frame field keeps its
/// value when the present bit is cleared, which is how a reserved frame can be
/// recorded in an entry before it is mapped.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Physical address mask for x86_64 page table entries.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Flag bits mask (bits 0-11 and 52-63).
    const FLAGS_MASK: u64 = !Self::ADDRESS_MASK;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 12 bits must be zero).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );

        let addr_bits = address.as_usize() as u64 & Self::ADDRESS_MASK;
        let flag_bits = flags.bits() & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(self.raw_address())
        } else {
            None
        }
    }

    /// Returns the frame stored in this entry, or None if the entry is not present.
    pub fn frame(self) -> Option<FrameNumber> {
        self.address().map(PhysicalAddress::frame_number)
    }

    /// Returns the address field regardless of the present bit.
    pub fn raw_address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    /// Returns the frame field regardless of the present bit.
    pub fn raw_frame(self) -> FrameNumber {
        self.raw_address().frame_number()
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        let addr_bits = self.0 & Self::ADDRESS_MASK;
        let flag_bits = flags.bits() & Self::FLAGS_MASK;
        self.0 = addr_bits | flag_bits;
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns whether this entry is present and user accessible.
    pub fn is_user(self) -> bool {
        self.is_present() && self.flags().is_user()
    }

    /// Returns whether this entry maps a large page.
    ///
    /// Only meaningful for level 1 (2 MiB) and level 2 (1 GiB) entries; at
    /// level 0 the same bit selects a memory type instead.
    pub fn is_large(self) -> bool {
        self.is_present() && self.flags().is_large()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Creates an entry from its raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of this entry.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for PageEntry {
    fn from(value: u64) -> Self {
        Self::from_raw(value)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("address", &self.raw_address())
            .field("flags", &self.flags())
            .finish()
    }
}
