//! Privileged instructions that act on the translation state of the executing CPU.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

/// Invalidates any cached translation for the page containing `address`.
#[inline]
pub fn flush(address: VirtualAddress) {
    tlb::flush(VirtAddr::new(address.as_usize() as u64));
}

/// Loads the root table at `root` into CR3.
///
/// # Safety
/// The table must be a valid PML4 that maps the kernel, including the code
/// currently executing and the table itself through the direct map.
pub unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: Caller guarantees the root table is valid
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}
