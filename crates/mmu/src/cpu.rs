//! Per-CPU translation context.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::FrameNumber;

/// The translation state of one execution unit.
///
/// Each CPU owns exactly one of these and passes it to operations that flush
/// cached translations or switch address spaces, so invalidations always
/// target the CPU that performed the change.
pub struct Cpu {
    id: usize,
    active_root: AtomicUsize,
}

impl Cpu {
    pub(crate) const fn new(id: usize, root: FrameNumber) -> Self {
        Self {
            id,
            active_root: AtomicUsize::new(root.as_usize()),
        }
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns the root frame of the address space active on this CPU.
    pub fn active_root(&self) -> FrameNumber {
        FrameNumber::new(self.active_root.load(Ordering::Acquire))
    }

    pub(crate) fn set_active_root(&self, root: FrameNumber) {
        self.active_root.store(root.as_usize(), Ordering::Release);
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("active_root", &self.active_root().start())
            .finish()
    }
}
