#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Polaris Memory Management Unit (MMU)
//!
//! The memory management unit of the Polaris kernel. It owns physical memory
//! and the hierarchical page tables, and provides:
//!
//! - A bitmap frame allocator with single and contiguous allocation.
//! - Page table walking, translation and large page mappings.
//! - Address space cloning, teardown, accounting and user pointer validation.
//! - The kernel heap break and MMIO windows.
//! - Software emulation of physical memory and the TLB for testing in
//!   non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod cpu;
mod frame_bitmap;
pub mod global;
mod heap;
mod human_size;
mod layout;
mod mmio;
mod mmu;
mod numbers;
mod page_directory;
mod physical_memory_manager;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, UserAccess};
pub use cpu::Cpu;
pub use frame_bitmap::{BootMemoryRegion, FrameBitmap};
pub(crate) use heap::KernelHeap;
pub use human_size::HumanSize;
pub use layout::MemoryLayout;
pub(crate) use mmio::MmioWindows;
pub use mmu::Mmu;
pub use numbers::FrameNumber;
pub(crate) use page_directory::PageDirectory;
pub use page_directory::{PageSize, TranslateError};
pub use physical_memory_manager::{MemoryStats, PhysicalMemoryManager};

pub use arch::{PAGE_SIZE, PageEntry, PageFlags, PageTable};
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, TlbEvent};
