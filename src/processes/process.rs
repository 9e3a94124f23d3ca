//! Process control blocks.

use alloc::sync::Arc;
use arrayvec::ArrayString;

use crate::events::EventQueue;
use crate::memory::paging::AddressSpace;
use crate::processes::registers::Registers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot unused; may be claimed by `spawn`.
    Dead,
    /// Runnable, eligible for selection.
    Ready,
    /// Waiting for a child to exit.
    Parked,
    /// Waiting for a sleep timer to run down.
    Sleeping,
    /// Finished; the slot is reclaimed lazily on the next schedule pass.
    Exited,
}

/// What backs a process's kernel or user stack, so exit can return it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackBacking {
    /// The boot stack. Never freed; only the idle process uses it.
    Boot,
    /// A kernel heap allocation.
    Heap { start: u32, size: usize },
    /// Pages mapped in the process's own address space.
    User { start: u32, size: usize },
}

pub struct Process {
    pub pid: usize,
    /// Spawning process, parked until this one exits.
    pub parent: usize,
    pub state: ProcessState,
    /// Time-slice weight. The scheduler multiplies the base period by this.
    pub priority: u32,
    pub context: Registers,
    pub stack: StackBacking,
    pub event_queue: Option<Arc<EventQueue>>,
    /// User processes own a paging context; kernel processes share the
    /// kernel's.
    pub address_space: Option<AddressSpace>,
    /// Execution-counter stamp from the last time this process ran.
    pub last_executed: u64,
    pub is_user: bool,
    pub name: ArrayString<32>,
}

impl Process {
    pub fn dead(pid: usize) -> Self {
        Process {
            pid,
            parent: 0,
            state: ProcessState::Dead,
            priority: 1,
            context: Registers::default(),
            stack: StackBacking::Boot,
            event_queue: None,
            address_space: None,
            last_executed: 0,
            is_user: false,
            name: ArrayString::new(),
        }
    }

    /// Returns the slot to its post-boot state. The pid is kept; everything
    /// else is cleared.
    pub fn reset(&mut self) {
        *self = Process::dead(self.pid);
    }
}
