#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod constants;
pub mod devices;
pub mod events;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod sync;
pub mod syscalls;

pub use init::{Kernel, KERNEL};

/// Parks the CPU until the next interrupt. The idle process (slot 0) sits
/// here whenever nothing else is `Ready`.
pub fn idle_loop() -> ! {
    loop {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86"))]
        core::hint::spin_loop();
    }
}
