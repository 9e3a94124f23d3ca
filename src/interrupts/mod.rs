//! Interrupt handlers.
//!
//! The assembly stubs in the embedding kernel push a [`Registers`] frame and
//! call in here. Both entry points take the kernel lock, so an interrupt
//! arriving while the lock is held elsewhere spins until the critical
//! section ends; the [`crate::sync::InterruptMutex`] keeps that from ever
//! being the same core.

use crate::init::KERNEL;
use crate::processes::Registers;
use crate::syscalls::{self, Collaborators};

/// IRQ0: the one-shot slice timer expired. Runs the scheduler, which swaps
/// process state through `frame` and re-arms the timer.
pub fn timer_interrupt(frame: &mut Registers) {
    let mut kernel = KERNEL.lock();
    if let Some(kernel) = kernel.as_mut() {
        let crate::Kernel { mem, heap, sched } = kernel;
        sched.schedule(mem, heap, frame);
    }
}

/// `int 0x80`: syscall entry. The number is in `eax`; results are written
/// back into `frame` before the stub returns to the caller.
pub fn software_interrupt(frame: &mut Registers, collab: &mut Collaborators<'_>) {
    let mut kernel = KERNEL.lock();
    match kernel.as_mut() {
        Some(kernel) => syscalls::dispatch(kernel, collab, frame),
        None => {
            log::error!("syscall {} before kernel init", frame.eax);
            frame.eax = -1i32 as u32;
        }
    }
}
