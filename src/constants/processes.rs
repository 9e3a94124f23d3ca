pub const MAX_PROCESSES: usize = 255;

/// 1 MiB stack default.
pub const STACK_SIZE: usize = 1024 * 1024;
pub const STACK_ALIGNMENT: usize = 16;

/// Timer ticks (milliseconds) a priority-1 process runs before preemption.
pub const BASE_PERIOD_TICKS: u64 = 100;

/// IF and the always-set reserved bit.
pub const DEFAULT_EFLAGS: u32 = 0x206;

// GDT selectors. User selectors carry RPL 3.
pub const KERNEL_CS: u32 = 0x08;
pub const KERNEL_DS: u32 = 0x10;
pub const USER_CS: u32 = 0x1b;
pub const USER_DS: u32 = 0x23;

/// Top of the user-mode stack mapping; the stack grows down from here.
pub const USER_STACK_TOP: u32 = 0xbfff_f000;

/// Capacity of each process's input event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;
