//! The kernel-wide memory manager instance.

use crate::Mmu;

static MMU: spin::Once<Mmu> = spin::Once::new();

/// Installs `mmu` as the kernel's memory manager.
///
/// # Panics
/// Panics if a memory manager was already installed.
pub fn init(mmu: Mmu) -> &'static Mmu {
    let mut installed = false;
    let mmu = MMU.call_once(|| {
        installed = true;
        mmu
    });
    assert!(installed, "memory manager initialized twice");
    mmu
}

/// Returns the kernel's memory manager.
///
/// # Panics
/// Panics if called before [`init`].
pub fn get() -> &'static Mmu {
    MMU.get().expect("memory manager used before initialization")
}

/// Returns the kernel's memory manager, if it has been installed.
pub fn try_get() -> Option<&'static Mmu> {
    MMU.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns the global so test ordering cannot matter.
    #[test]
    fn installs_once() {
        assert!(try_get().is_none());
        let mmu = init(Mmu::emulated(64));
        assert!(core::ptr::eq(mmu, get()));

        let again = std::panic::catch_unwind(|| init(Mmu::emulated(64)));
        assert!(again.is_err());
        assert!(core::ptr::eq(mmu, get()));
    }
}
