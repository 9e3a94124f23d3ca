//! Process management: control blocks, saved register state and the
//! scheduler.

pub mod process;
pub mod registers;
pub mod scheduler;

pub use process::{Process, ProcessState};
pub use registers::Registers;
pub use scheduler::{Scheduler, SchedulerError};
