pub mod memory;
pub mod processes;
pub mod syscalls;
