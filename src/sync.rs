//! Interrupt-safe critical sections.
//!
//! There is one core, so a spin lock alone is enough against other code paths,
//! but the timer interrupt can fire mid-mutation and re-enter the scheduler or
//! the paging manager. Every shared table (process table, chunk list, page
//! bitmaps) is therefore guarded by an [`InterruptMutex`]: a `spin::Mutex`
//! whose guard also keeps interrupts masked until it drops.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

/// Returns whether interrupts were enabled, then disables them.
#[inline]
fn disable_interrupts() -> bool {
    #[cfg(target_arch = "x86")]
    unsafe {
        let eflags: u32;
        core::arch::asm!(
            "pushfd",
            "pop {0}",
            "cli",
            out(reg) eflags,
            options(nomem, preserves_flags)
        );
        (eflags & 0x200) != 0
    }
    #[cfg(not(target_arch = "x86"))]
    false
}

#[inline]
fn enable_interrupts() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Runs `f` with interrupts masked, restoring the previous state afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = disable_interrupts();
    let result = f();
    if were_enabled {
        enable_interrupts();
    }
    result
}

/// A spin lock that masks interrupts for the lifetime of its guard.
pub struct InterruptMutex<T> {
    inner: Mutex<T>,
}

pub struct InterruptMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    reenable: bool,
}

impl<T> InterruptMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> InterruptMutexGuard<'_, T> {
        let reenable = disable_interrupts();
        InterruptMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            reenable,
        }
    }
}

impl<T> Deref for InterruptMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for InterruptMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for InterruptMutexGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before interrupts come back on.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.reenable {
            enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gives_exclusive_access() {
        let m = InterruptMutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn without_interrupts_passes_result_through() {
        assert_eq!(without_interrupts(|| 41 + 1), 42);
    }
}
