//! Address types for physical and virtual memory management.
//!
//! This module provides wrappers around physical and virtual addresses, and the
//! translator that turns a physical address into something the kernel can
//! dereference.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::{EmulatedMemory, TlbEvent};

/// Address translator for converting physical addresses into usable pointers.
///
/// This enum supports two modes:
/// - Hardware: physical memory is reachable through the kernel's direct map
/// - Emulated: physical memory is a host buffer (testing mode)
///
/// The translator is also the single place that touches per-CPU translation
/// state, so TLB flushes and root loads go through it as well.
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns the emulated memory backing this translator, if any.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(memory) => Some(memory),
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }

    /// Returns a pointer to the start of `frame`.
    pub fn frame_ptr<T>(&self, frame: FrameNumber) -> *mut T {
        self.phys_to_ptr(frame.start())
    }

    /// Fills `frame` with zeroes.
    pub fn zero_frame(&self, frame: FrameNumber) {
        let ptr = self.frame_ptr::<u8>(frame);
        // SAFETY: frame is owned by the caller and the translator maps a whole page
        unsafe { core::ptr::write_bytes(ptr, 0, arch::PAGE_SIZE) };
    }

    /// Copies the contents of `source` into `target`.
    pub fn copy_frame(&self, source: FrameNumber, target: FrameNumber) {
        let from = self.frame_ptr::<u8>(source);
        let to = self.frame_ptr::<u8>(target);
        // SAFETY: distinct frames never overlap and each spans one page
        unsafe { core::ptr::copy_nonoverlapping(from, to, arch::PAGE_SIZE) };
    }

    /// Invalidates the cached translation for `address` on the CPU with `cpu_id`.
    ///
    /// On hardware this executes on the current CPU; the caller passes its own id.
    pub fn flush(&self, cpu_id: usize, address: VirtualAddress) {
        match self {
            Self::Hardware { .. } => {
                let _ = cpu_id;
                #[cfg(target_arch = "x86_64")]
                arch::flush(address);
                #[cfg(not(target_arch = "x86_64"))]
                unimplemented!("hardware TLB flush of {address} requires an x86_64 target");
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.record(TlbEvent::Flush {
                cpu: cpu_id,
                address,
            }),
        }
    }

    /// Makes `root` the active top-level table on the CPU with `cpu_id`.
    ///
    /// # Safety
    /// On hardware, `root` must be a valid top-level table that maps the kernel.
    pub unsafe fn load_root(&self, cpu_id: usize, root: PhysicalAddress) {
        match self {
            Self::Hardware { .. } => {
                let _ = cpu_id;
                #[cfg(target_arch = "x86_64")]
                // SAFETY: Caller guarantees root is valid
                unsafe {
                    arch::load_root(root)
                };
                #[cfg(not(target_arch = "x86_64"))]
                unimplemented!("loading root {root} requires an x86_64 target");
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.record(TlbEvent::LoadRoot { cpu: cpu_id, root }),
        }
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address is on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are limited to the architecture's physical address width."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> arch::PAGE_SHIFT)
    }

    /// Returns the offset of this address within its frame.
    #[inline]
    pub const fn frame_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Virtual addresses are always canonical. They provide the page table indices\n\
     used to walk the hierarchy."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_virtual(addr),
            "address is not canonical"
        );
        Self(addr)
    }

    /// Creates a virtual address, returning None if it is not canonical.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if crate::arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the offset within a 4 KiB page (bits 0-11).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index at the specified level.
    ///
    /// Level 0 is the page table closest to the page; level 3 is the root.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns true if this address belongs to the user (lower) half.
    #[inline]
    pub const fn is_lower_half(self) -> bool {
        arch::is_lower_half(self.0)
    }
}
