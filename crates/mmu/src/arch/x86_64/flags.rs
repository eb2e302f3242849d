//! Page table entry flags for x86_64 architecture.

use core::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags. The same bits are used
/// for leaf entries and for the links to lower-level tables.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    pub const PRESENT: Self = Self(PageTableFlags::PRESENT);
    pub const WRITABLE: Self = Self(PageTableFlags::WRITABLE);
    pub const USER: Self = Self(PageTableFlags::USER_ACCESSIBLE);
    pub const WRITE_THROUGH: Self = Self(PageTableFlags::WRITE_THROUGH);
    pub const NO_CACHE: Self = Self(PageTableFlags::NO_CACHE);
    pub const ACCESSED: Self = Self(PageTableFlags::ACCESSED);
    pub const DIRTY: Self = Self(PageTableFlags::DIRTY);
    /// Maps a 2 MiB or 1 GiB page directly from a level 1 or level 2 entry.
    pub const LARGE: Self = Self(PageTableFlags::HUGE_PAGE);
    pub const GLOBAL: Self = Self(PageTableFlags::GLOBAL);
    pub const NO_EXECUTE: Self = Self(PageTableFlags::NO_EXECUTE);

    /// Link to a lower-level table that may hold both user and kernel leaves.
    pub const USER_TABLE: Self = Self(
        PageTableFlags::PRESENT
            .union(PageTableFlags::WRITABLE)
            .union(PageTableFlags::USER_ACCESSIBLE),
    );

    /// Link to a lower-level table that only ever holds kernel leaves.
    pub const KERNEL_TABLE: Self =
        Self(PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE));

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Creates flags from raw entry bits, dropping bits with no defined meaning.
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(bits))
    }

    /// Returns the raw bits of these flags.
    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0.contains(other.0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0.union(other.0))
    }

    /// Returns these flags with the bits of `other` removed.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0.difference(other.0))
    }

    /// Sets or clears the bits of `other`.
    pub fn set(&mut self, other: Self, value: bool) {
        self.0.set(other.0, value);
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    /// Returns whether user mode may access the page.
    pub const fn is_user(self) -> bool {
        self.contains(Self::USER)
    }

    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    pub const fn is_large(self) -> bool {
        self.contains(Self::LARGE)
    }

    pub const fn is_no_cache(self) -> bool {
        self.contains(Self::NO_CACHE)
    }

    pub const fn is_write_through(self) -> bool {
        self.contains(Self::WRITE_THROUGH)
    }

    pub const fn is_no_execute(self) -> bool {
        self.contains(Self::NO_EXECUTE)
    }
}

impl From<PageTableFlags> for PageFlags {
    fn from(flags: PageTableFlags) -> Self {
        Self(flags)
    }
}

impl From<PageFlags> for PageTableFlags {
    fn from(flags: PageFlags) -> Self {
        flags.0
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for PageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFlags({:?})", self.0)
    }
}
