//! Software-interrupt entry and dispatch.
//!
//! `int 0x80` lands here with the syscall number in `eax` and up to three
//! arguments in `ebx`, `ecx`, `edx`. Results go back through `eax` (and
//! `edx` for 64-bit values); failures return `-1` in `eax`.
//!
//! The filesystem, wall clock and display live outside this crate, so their
//! syscalls route through the [`Collaborators`] traits the embedding kernel
//! provides.

use crate::constants::syscalls::*;
use crate::init::Kernel;
use crate::processes::Registers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Write,
    Read,
    Seek,
    Open,
    Close,
    Exit,
    SleepMs,
    GetTickMs,
    GetCurrentClock,
    ProbeEvents,
    GetEvent,
    DrawRegion,
    ClearTerm,
    GetTime,
    GetEpoch,
    Mmap,
    Munmap,
    Execf,
    Yield,
}

impl Syscall {
    pub fn from_u32(number: u32) -> Option<Self> {
        Some(match number {
            SYSCALL_WRITE => Syscall::Write,
            SYSCALL_READ => Syscall::Read,
            SYSCALL_SEEK => Syscall::Seek,
            SYSCALL_OPEN => Syscall::Open,
            SYSCALL_CLOSE => Syscall::Close,
            SYSCALL_EXIT => Syscall::Exit,
            SYSCALL_SLEEP_MS => Syscall::SleepMs,
            SYSCALL_GET_TICK_MS => Syscall::GetTickMs,
            SYSCALL_GET_CURRENT_CLOCK => Syscall::GetCurrentClock,
            SYSCALL_PROBE_EVENTS => Syscall::ProbeEvents,
            SYSCALL_GET_EVENT => Syscall::GetEvent,
            SYSCALL_DRAW_REGION => Syscall::DrawRegion,
            SYSCALL_CLEAR_TERM => Syscall::ClearTerm,
            SYSCALL_GET_TIME => Syscall::GetTime,
            SYSCALL_GET_EPOCH => Syscall::GetEpoch,
            SYSCALL_MMAP => Syscall::Mmap,
            SYSCALL_MUNMAP => Syscall::Munmap,
            SYSCALL_EXECF => Syscall::Execf,
            SYSCALL_YIELD => Syscall::Yield,
            _ => return None,
        })
    }
}

/// File and executable operations, backed by the filesystem driver.
/// Buffer and path arguments are user-space pointers the implementation
/// validates against the calling process's mappings.
pub trait FileOps {
    fn write(&mut self, fd: u32, buf: u32, len: u32) -> i32;
    fn read(&mut self, fd: u32, buf: u32, len: u32) -> i32;
    fn seek(&mut self, fd: u32, offset: u32) -> i32;
    fn open(&mut self, path: u32, flags: u32) -> i32;
    fn close(&mut self, fd: u32) -> i32;
    /// Loads the executable at `path` into memory and returns its entry
    /// point.
    fn load_executable(&mut self, path: u32) -> Option<u32>;
}

/// Time sources, backed by the PIT tick count and the RTC.
pub trait ClockOps {
    fn tick_ms(&self) -> u64;
    fn current_clock(&self) -> u64;
    fn time(&self) -> u64;
    fn epoch(&self) -> u64;
}

/// Terminal and framebuffer operations, backed by the display driver.
pub trait DisplayOps {
    fn draw_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> i32;
    fn clear(&mut self);
}

pub struct Collaborators<'a> {
    pub files: &'a mut dyn FileOps,
    pub clock: &'a dyn ClockOps,
    pub display: &'a mut dyn DisplayOps,
}

const ERR: u32 = -1i32 as u32;

fn split_u64(value: u64, regs: &mut Registers) {
    regs.eax = value as u32;
    regs.edx = (value >> 32) as u32;
}

/// Decodes and runs one syscall, writing results back into `regs` (which is
/// also the register frame the process resumes from).
pub fn dispatch(kernel: &mut Kernel, collab: &mut Collaborators<'_>, regs: &mut Registers) {
    let (b, c, d) = (regs.ebx, regs.ecx, regs.edx);

    let Some(syscall) = Syscall::from_u32(regs.eax) else {
        log::warn!(
            "unhandled syscall {} from process {}",
            regs.eax,
            kernel.sched.current_process_id()
        );
        regs.eax = ERR;
        return;
    };

    match syscall {
        Syscall::Write => regs.eax = collab.files.write(b, c, d) as u32,
        Syscall::Read => regs.eax = collab.files.read(b, c, d) as u32,
        Syscall::Seek => regs.eax = collab.files.seek(b, c) as u32,
        Syscall::Open => regs.eax = collab.files.open(b, c) as u32,
        Syscall::Close => regs.eax = collab.files.close(b) as u32,
        Syscall::Exit => {
            let Kernel { mem, heap, sched } = kernel;
            sched.exit(mem, heap, regs);
        }
        Syscall::SleepMs => {
            kernel.sched.sleep(u64::from(b));
            regs.eax = 0;
        }
        Syscall::GetTickMs => split_u64(collab.clock.tick_ms(), regs),
        Syscall::GetCurrentClock => split_u64(collab.clock.current_clock(), regs),
        Syscall::GetTime => split_u64(collab.clock.time(), regs),
        Syscall::GetEpoch => split_u64(collab.clock.epoch(), regs),
        Syscall::ProbeEvents => {
            regs.eax = match kernel.sched.current_event_queue() {
                Some(queue) => queue.pending() as u32,
                None => 0,
            };
        }
        Syscall::GetEvent => {
            let event = match kernel.sched.current_event_queue() {
                Some(queue) => queue.pop(),
                None => crate::events::Event::none(),
            };
            regs.eax = event.kind as u32;
            regs.ebx = event.lower;
            regs.ecx = event.upper;
        }
        Syscall::DrawRegion => regs.eax = collab.display.draw_region(b, c, d, regs.edi) as u32,
        Syscall::ClearTerm => {
            collab.display.clear();
            regs.eax = 0;
        }
        Syscall::Mmap => {
            regs.eax = match kernel.mmap_current(b, c as usize) {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("mmap({b:#x}, {c:#x}) failed: {err}");
                    ERR
                }
            };
        }
        Syscall::Munmap => {
            regs.eax = match kernel.munmap_current(b, c as usize) {
                Ok(()) => 0,
                Err(err) => {
                    log::warn!("munmap({b:#x}, {c:#x}) failed: {err}");
                    ERR
                }
            };
        }
        Syscall::Execf => {
            let Kernel { mem, heap, sched } = kernel;
            regs.eax = match collab.files.load_executable(b) {
                Some(entry) => match sched.spawn(mem, heap, entry, "execf", true) {
                    Ok(pid) => pid as u32,
                    Err(err) => {
                        log::warn!("execf spawn failed: {err}");
                        ERR
                    }
                },
                None => ERR,
            };
        }
        Syscall::Yield => {
            let Kernel { mem, heap, sched } = kernel;
            sched.yield_now(mem, heap, regs);
        }
    }
}
