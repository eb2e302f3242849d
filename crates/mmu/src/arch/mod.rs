//! Architecture-specific implementations for memory management.
//!
//! Page tables always use the x86_64 encoding. On hardware the MMU walks them
//! directly; under software emulation they live in a host buffer standing in
//! for physical memory, so the walker and the address space code run unchanged.

mod x86_64;
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedMemory, TlbEvent};
