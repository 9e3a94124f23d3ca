// Syscall numbers, passed in eax by `int 0x80`.
pub const SYSCALL_WRITE: u32 = 0;
pub const SYSCALL_READ: u32 = 1;
pub const SYSCALL_SEEK: u32 = 2;
pub const SYSCALL_OPEN: u32 = 3;
pub const SYSCALL_CLOSE: u32 = 4;
pub const SYSCALL_EXIT: u32 = 5;
pub const SYSCALL_SLEEP_MS: u32 = 6;
pub const SYSCALL_GET_TICK_MS: u32 = 7;
pub const SYSCALL_GET_CURRENT_CLOCK: u32 = 8;
pub const SYSCALL_PROBE_EVENTS: u32 = 9;
pub const SYSCALL_GET_EVENT: u32 = 10;
pub const SYSCALL_DRAW_REGION: u32 = 11;
pub const SYSCALL_CLEAR_TERM: u32 = 12;
pub const SYSCALL_GET_TIME: u32 = 13;
pub const SYSCALL_GET_EPOCH: u32 = 14;
pub const SYSCALL_MMAP: u32 = 15;
pub const SYSCALL_MUNMAP: u32 = 16;
pub const SYSCALL_EXECF: u32 = 17;
pub const SYSCALL_YIELD: u32 = 18;
