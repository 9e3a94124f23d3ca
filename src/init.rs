//! Kernel bring-up and the global kernel state.
//!
//! Everything the interrupt handlers need lives in one [`Kernel`] value
//! behind an [`InterruptMutex`], so a timer interrupt can never observe the
//! memory manager, heap or scheduler mid-mutation.

use alloc::boxed::Box;
use lazy_static::lazy_static;

use crate::devices::OneShotTimer;
use crate::logging;
use crate::memory::heap::HeapAllocator;
use crate::memory::paging::{EntryFlags, MemoryManager};
use crate::memory::{MemoryError, MemoryRegion};
use crate::processes::Scheduler;
use crate::sync::InterruptMutex;

pub struct Kernel {
    pub mem: MemoryManager,
    pub heap: HeapAllocator,
    pub sched: Scheduler,
}

lazy_static! {
    /// The global kernel state; `None` until [`init`] has run.
    pub static ref KERNEL: InterruptMutex<Option<Kernel>> = InterruptMutex::new(None);
}

/// Brings the kernel core up from the boot loader's memory map: logging,
/// paging, the kernel heap, then the scheduler with the boot flow installed
/// as the idle process. On x86 this also turns paging on.
pub fn init(
    regions: &[MemoryRegion],
    kernel_break: u32,
    timer: Box<dyn OneShotTimer>,
    idle_entry: u32,
) -> Result<(), MemoryError> {
    logging::init();
    let mut mem = MemoryManager::init(regions, kernel_break)?;
    let heap = HeapAllocator::init(&mut mem)?;
    #[cfg(target_arch = "x86")]
    unsafe {
        mem.enable();
    }
    let sched = Scheduler::new(timer, idle_entry);
    *KERNEL.lock() = Some(Kernel { mem, heap, sched });
    log::info!("kernel core up, break at {kernel_break:#x}");
    Ok(())
}

impl Kernel {
    /// Maps fresh pages for the current process: into its own address space
    /// for user processes, into the kernel's otherwise.
    pub fn mmap_current(&mut self, addr_hint: u32, length: usize) -> Result<u32, MemoryError> {
        let pid = self.sched.current_process_id();
        match self.sched.address_space_mut(pid) {
            Some(space) => space.mmap(
                &mut self.mem.frames,
                addr_hint,
                length,
                EntryFlags::WRITABLE | EntryFlags::USER,
            ),
            None => self.mem.mmap(addr_hint, length, EntryFlags::WRITABLE),
        }
    }

    /// Unmaps pages from the current process's address space.
    pub fn munmap_current(&mut self, address: u32, length: usize) -> Result<(), MemoryError> {
        let pid = self.sched.current_process_id();
        match self.sched.address_space_mut(pid) {
            Some(space) => space.munmap(&mut self.mem.frames, address, length),
            None => self.mem.munmap(address, length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionKind;

    struct NullTimer;

    impl OneShotTimer for NullTimer {
        fn arm(&mut self, _ticks: u64) {}
    }

    #[test]
    fn init_populates_the_global_kernel() {
        let regions = [MemoryRegion {
            address: 0x100000,
            length: 0x400000,
            kind: RegionKind::Usable,
        }];
        init(&regions, 0x180000, Box::new(NullTimer), 0x1000).unwrap();

        let mut kernel = KERNEL.lock();
        let kernel = kernel.as_mut().unwrap();
        assert_eq!(kernel.sched.current_process_id(), 0);

        // The idle process maps and unmaps through the kernel space.
        let addr = kernel.mmap_current(0, 4096).unwrap();
        assert!(kernel.mem.kernel.translate(addr).is_ok());
        kernel.munmap_current(addr, 4096).unwrap();
        assert!(kernel.mem.kernel.translate(addr).is_err());
    }
}
