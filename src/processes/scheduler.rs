//! Priority-weighted round-robin scheduler.
//!
//! Selection picks the `Ready` process that ran longest ago; priorities do
//! not affect who runs next, only how long a slice they get. The timer is
//! re-armed on every switch for `base_period * priority` ticks, so a
//! priority-3 process runs three times as long per turn as a priority-1 one.
//!
//! Slot 0 is the idle process. It is never selected while anything else is
//! `Ready` and is the fallback when nothing is.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::constants::processes::{
    BASE_PERIOD_TICKS, DEFAULT_EFLAGS, EVENT_QUEUE_CAPACITY, KERNEL_CS, KERNEL_DS, MAX_PROCESSES,
    STACK_ALIGNMENT, STACK_SIZE, USER_CS, USER_DS, USER_STACK_TOP,
};
use crate::devices::OneShotTimer;
use crate::events::EventQueue;
use crate::memory::heap::HeapAllocator;
use crate::memory::paging::{AddressSpace, EntryFlags, MemoryManager};
use crate::memory::MemoryError;
use crate::processes::process::{Process, ProcessState, StackBacking};
use crate::processes::registers::Registers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// Every process slot is occupied.
    NoFreeSlot,
    Memory(MemoryError),
}

impl From<MemoryError> for SchedulerError {
    fn from(err: MemoryError) -> Self {
        SchedulerError::Memory(err)
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::NoFreeSlot => f.write_str("no free process slot"),
            SchedulerError::Memory(err) => write!(f, "memory: {err}"),
        }
    }
}

/// A pending sleep. Signed so an overshoot past zero still wakes.
struct SleepTimer {
    pid: usize,
    remaining_ticks: i64,
}

pub struct Scheduler {
    processes: Vec<Process>,
    sleepers: Vec<SleepTimer>,
    current: usize,
    /// Advances by the incoming priority on every switch; `last_executed`
    /// stamps come from it.
    execution_counter: u64,
    /// Ticks the timer was armed for on the last switch. Sleep accounting
    /// uses it as "time elapsed" when the next interrupt arrives.
    last_armed: u64,
    timer: Box<dyn OneShotTimer>,
    base_period: u64,
}

impl Scheduler {
    /// Builds the process table with the idle process in slot 0. The boot
    /// flow itself becomes the idle process: its live registers are captured
    /// into slot 0 on the first timer interrupt.
    pub fn new(timer: Box<dyn OneShotTimer>, idle_entry: u32) -> Self {
        let mut processes: Vec<Process> = (0..MAX_PROCESSES).map(Process::dead).collect();
        let idle = &mut processes[0];
        idle.state = ProcessState::Ready;
        idle.context.eip = idle_entry;
        idle.context.cs = KERNEL_CS;
        idle.context.ds = KERNEL_DS;
        idle.context.es = KERNEL_DS;
        idle.context.fs = KERNEL_DS;
        idle.context.gs = KERNEL_DS;
        idle.context.ss = KERNEL_DS;
        idle.context.eflags = DEFAULT_EFLAGS;
        idle.name.push_str("idle");
        Self {
            processes,
            sleepers: Vec::new(),
            current: 0,
            execution_counter: 0,
            last_armed: 0,
            timer,
            base_period: BASE_PERIOD_TICKS,
        }
    }

    pub fn current_process_id(&self) -> usize {
        self.current
    }

    pub fn current_event_queue(&self) -> Option<Arc<EventQueue>> {
        self.processes[self.current].event_queue.clone()
    }

    pub fn address_space_mut(&mut self, pid: usize) -> Option<&mut AddressSpace> {
        self.processes.get_mut(pid)?.address_space.as_mut()
    }

    pub fn set_priority(&mut self, pid: usize, priority: u32) {
        if let Some(process) = self.processes.get_mut(pid) {
            process.priority = priority.max(1);
        }
    }

    /// Creates a process and parks the caller until it exits. Kernel
    /// processes get a heap stack and share the kernel address space; user
    /// processes get their own space with a stack mapped below the user
    /// stack top, plus an event queue.
    ///
    /// The timer is armed for one tick so the new process is picked up
    /// immediately.
    pub fn spawn(
        &mut self,
        mem: &mut MemoryManager,
        heap: &mut HeapAllocator,
        entry: u32,
        name: &str,
        is_user: bool,
    ) -> Result<usize, SchedulerError> {
        let pid = (1..MAX_PROCESSES)
            .find(|&i| self.processes[i].state == ProcessState::Dead)
            .ok_or(SchedulerError::NoFreeSlot)?;

        let mut context = Registers {
            eip: entry,
            eflags: DEFAULT_EFLAGS,
            ..Registers::default()
        };
        let stack;
        let mut address_space = None;
        let mut event_queue = None;

        if is_user {
            let mut space = AddressSpace::new_user(&mem.kernel);
            let stack_hint = USER_STACK_TOP - STACK_SIZE as u32;
            let start = space.mmap(
                &mut mem.frames,
                stack_hint,
                STACK_SIZE,
                EntryFlags::WRITABLE | EntryFlags::USER,
            )?;
            stack = StackBacking::User {
                start,
                size: STACK_SIZE,
            };
            context.cs = USER_CS;
            context.ds = USER_DS;
            context.es = USER_DS;
            context.fs = USER_DS;
            context.gs = USER_DS;
            context.ss = USER_DS;
            context.useresp = start + STACK_SIZE as u32;
            address_space = Some(space);
            event_queue = Some(Arc::new(EventQueue::new(EVENT_QUEUE_CAPACITY)));
        } else {
            let start = heap.allocate_aligned(mem, STACK_SIZE, STACK_ALIGNMENT as u32)?;
            stack = StackBacking::Heap {
                start,
                size: STACK_SIZE,
            };
            let top = start + STACK_SIZE as u32;
            context.cs = KERNEL_CS;
            context.ds = KERNEL_DS;
            context.es = KERNEL_DS;
            context.fs = KERNEL_DS;
            context.gs = KERNEL_DS;
            context.ss = KERNEL_DS;
            context.esp = top;
            context.ebp = top;
        }

        let process = &mut self.processes[pid];
        process.parent = self.current;
        process.state = ProcessState::Ready;
        process.priority = 1;
        process.context = context;
        process.stack = stack;
        process.event_queue = event_queue;
        process.address_space = address_space;
        process.last_executed = 0;
        process.is_user = is_user;
        process.name.clear();
        for ch in name.chars() {
            if process.name.try_push(ch).is_err() {
                break;
            }
        }

        log::info!(
            "spawned {} process {pid} ({name}), entry {entry:#x}",
            if is_user { "user" } else { "kernel" },
        );

        self.processes[self.current].state = ProcessState::Parked;
        self.timer.arm(1);
        self.last_armed = 1;
        Ok(pid)
    }

    /// The timer-interrupt path: the armed period has fully elapsed, so it
    /// counts against sleep timers. Reclaims exited processes, picks the next
    /// process, swaps register state through `frame` and re-arms the timer
    /// for the incoming priority's slice.
    pub fn schedule(
        &mut self,
        mem: &mut MemoryManager,
        heap: &mut HeapAllocator,
        frame: &mut Registers,
    ) {
        self.reschedule(mem, heap, frame, self.last_armed);
    }

    fn reschedule(
        &mut self,
        mem: &mut MemoryManager,
        heap: &mut HeapAllocator,
        frame: &mut Registers,
        elapsed_ticks: u64,
    ) {
        self.reclaim_exited(mem, heap);
        self.tick_sleepers(elapsed_ticks);

        let next = self.pick_next();
        if self.processes[self.current].state != ProcessState::Dead {
            self.processes[self.current].context = *frame;
        }

        let period = self.base_period * u64::from(self.processes[next].priority);
        self.timer.arm(period);
        self.last_armed = period;

        self.execution_counter += u64::from(self.processes[next].priority);
        self.processes[next].last_executed = self.execution_counter;
        *frame = self.processes[next].context;

        #[cfg(target_arch = "x86")]
        unsafe {
            match self.processes[next].address_space.as_ref() {
                Some(space) => space.activate(),
                None => mem.kernel.activate(),
            }
        }

        if next != self.current {
            log::trace!("switch {} -> {}", self.current, next);
        }
        self.current = next;
    }

    /// Puts the current process to sleep for `ticks` timer ticks, then forces
    /// an immediate reschedule via a one-tick arm. The idle process never
    /// sleeps.
    pub fn sleep(&mut self, ticks: u64) {
        if self.current == 0 {
            log::warn!("idle process cannot sleep");
            return;
        }
        self.sleepers.push(SleepTimer {
            pid: self.current,
            remaining_ticks: ticks as i64,
        });
        self.processes[self.current].state = ProcessState::Sleeping;
        self.timer.arm(1);
        self.last_armed = 1;
    }

    /// Gives up the rest of the current slice voluntarily. A yield arrives
    /// mid-slice, so no ticks are counted against sleep timers; sleepers may
    /// overshoot their deadline but never wake early.
    pub fn yield_now(
        &mut self,
        mem: &mut MemoryManager,
        heap: &mut HeapAllocator,
        frame: &mut Registers,
    ) {
        self.reschedule(mem, heap, frame, 0);
    }

    /// Terminates the current process and switches away from it. Its
    /// resources are reclaimed on the next schedule pass, after execution has
    /// left its stack. The idle process cannot exit; for it this is just a
    /// reschedule.
    pub fn exit(&mut self, mem: &mut MemoryManager, heap: &mut HeapAllocator, frame: &mut Registers) {
        self.mark_exited(self.current);
        self.reschedule(mem, heap, frame, 0);
    }

    /// Terminates `pid` without rescheduling. If `pid` is currently running
    /// it keeps running until the next timer interrupt.
    pub fn kill(&mut self, pid: usize) -> bool {
        if pid == 0 || pid >= MAX_PROCESSES {
            return false;
        }
        self.mark_exited(pid)
    }

    fn mark_exited(&mut self, pid: usize) -> bool {
        if pid == 0 {
            return false;
        }
        match self.processes[pid].state {
            ProcessState::Dead | ProcessState::Exited => return false,
            _ => {}
        }
        self.processes[pid].state = ProcessState::Exited;
        let parent = self.processes[pid].parent;
        if self.processes[parent].state == ProcessState::Parked {
            self.processes[parent].state = ProcessState::Ready;
        }
        true
    }

    /// Frees the stacks and address spaces of exited processes and returns
    /// their slots to `Dead`. The currently running process is skipped even
    /// if exited, since its stack is still in use.
    fn reclaim_exited(&mut self, mem: &mut MemoryManager, heap: &mut HeapAllocator) {
        for pid in 1..MAX_PROCESSES {
            if self.processes[pid].state != ProcessState::Exited || pid == self.current {
                continue;
            }
            match self.processes[pid].stack {
                StackBacking::Heap { start, .. } => {
                    if let Err(err) = heap.free(mem, start) {
                        log::error!("reclaiming stack of process {pid}: {err}");
                    }
                }
                StackBacking::User { .. } | StackBacking::Boot => {}
            }
            if let Some(mut space) = self.processes[pid].address_space.take() {
                space.release_all(&mut mem.frames);
            }
            self.sleepers.retain(|s| s.pid != pid);
            log::debug!("reclaimed process {pid}");
            self.processes[pid].reset();
        }
    }

    /// Counts `elapsed_ticks` against every sleeper and wakes the ones that
    /// ran out.
    fn tick_sleepers(&mut self, elapsed_ticks: u64) {
        let elapsed = elapsed_ticks as i64;
        let processes = &mut self.processes;
        self.sleepers.retain_mut(|sleeper| {
            sleeper.remaining_ticks -= elapsed;
            if sleeper.remaining_ticks > 0 {
                return true;
            }
            if processes[sleeper.pid].state == ProcessState::Sleeping {
                processes[sleeper.pid].state = ProcessState::Ready;
            }
            false
        });
    }

    /// The `Ready` process with the oldest `last_executed` stamp, ties going
    /// to the lowest pid. Idle only when nothing else is runnable.
    fn pick_next(&self) -> usize {
        (1..MAX_PROCESSES)
            .filter(|&pid| self.processes[pid].state == ProcessState::Ready)
            .min_by_key(|&pid| self.processes[pid].last_executed)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn process(&self, pid: usize) -> &Process {
        &self.processes[pid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegion, RegionKind};
    use spin::Mutex;

    struct MockTimer {
        armed: Arc<Mutex<Vec<u64>>>,
    }

    impl OneShotTimer for MockTimer {
        fn arm(&mut self, ticks: u64) {
            self.armed.lock().push(ticks);
        }
    }

    fn fixture() -> (MemoryManager, HeapAllocator, Scheduler, Arc<Mutex<Vec<u64>>>) {
        let regions = [MemoryRegion {
            address: 0x100000,
            length: 0x800000,
            kind: RegionKind::Usable,
        }];
        let mut mem = MemoryManager::init(&regions, 0x180000).unwrap();
        let heap = HeapAllocator::init(&mut mem).unwrap();
        let armed = Arc::new(Mutex::new(Vec::new()));
        let sched = Scheduler::new(
            Box::new(MockTimer {
                armed: armed.clone(),
            }),
            0x1000,
        );
        (mem, heap, sched, armed)
    }

    fn tick(sched: &mut Scheduler, mem: &mut MemoryManager, heap: &mut HeapAllocator) -> usize {
        let mut frame = Registers::default();
        sched.schedule(mem, heap, &mut frame);
        sched.current_process_id()
    }

    #[test]
    fn equal_priorities_rotate_fairly() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        let b = sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();
        let c = sched.spawn(&mut mem, &mut heap, 0x4000, "c", false).unwrap();

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(tick(&mut sched, &mut mem, &mut heap));
        }
        assert_eq!(order, vec![a, b, c, a, b, c]);
    }

    #[test]
    fn slice_length_follows_incoming_priority() {
        let (mut mem, mut heap, mut sched, armed) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        sched.set_priority(a, 3);

        tick(&mut sched, &mut mem, &mut heap);
        // spawn armed 1 tick, then the switch to `a` armed 3 base periods.
        assert_eq!(*armed.lock(), vec![1, 3 * BASE_PERIOD_TICKS]);
    }

    #[test]
    fn priority_does_not_change_selection_order() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        let b = sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();
        sched.set_priority(b, 5);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(tick(&mut sched, &mut mem, &mut heap));
        }
        // b gets longer slices, not more of them.
        assert_eq!(order, vec![a, b, a, b]);
    }

    #[test]
    fn outgoing_registers_are_saved_and_restored() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();

        let mut frame = Registers::default();
        sched.schedule(&mut mem, &mut heap, &mut frame);
        assert_eq!(sched.current_process_id(), a);
        assert_eq!(frame.eip, 0x2000);

        frame.eax = 0xbeef;
        sched.schedule(&mut mem, &mut heap, &mut frame);
        assert_eq!(frame.eip, 0x3000);

        // Back to a with its eax intact.
        sched.schedule(&mut mem, &mut heap, &mut frame);
        assert_eq!(frame.eip, 0x2000);
        assert_eq!(frame.eax, 0xbeef);
    }

    #[test]
    fn sleeper_wakes_after_enough_slices() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        let b = sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();

        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
        sched.sleep(BASE_PERIOD_TICKS * 2 + BASE_PERIOD_TICKS / 2);

        // a is asleep for two and a half base periods; b soaks up the time.
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), b);
        assert_eq!(sched.process(a).state, ProcessState::Sleeping);
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), b);
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), b);
        // Third full period overshoots the deadline; a is runnable again.
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
    }

    #[test]
    fn yields_do_not_age_sleep_timers() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        let b = sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();

        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
        sched.sleep(BASE_PERIOD_TICKS * 10);

        // b yields back-to-back; no timer ever fired, so no sleep time has
        // passed and a must still be asleep.
        let mut frame = Registers::default();
        for _ in 0..10 {
            sched.yield_now(&mut mem, &mut heap, &mut frame);
            assert_eq!(sched.current_process_id(), b);
        }
        assert_eq!(sched.process(a).state, ProcessState::Sleeping);

        // Full timer slices still run the sleep down: ten base periods.
        for _ in 0..9 {
            assert_eq!(tick(&mut sched, &mut mem, &mut heap), b);
        }
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
    }

    #[test]
    fn exit_from_idle_is_a_plain_reschedule() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let mut frame = Registers::default();
        sched.exit(&mut mem, &mut heap, &mut frame);
        assert_eq!(sched.current_process_id(), 0);
        assert_eq!(sched.process(0).state, ProcessState::Ready);
    }

    #[test]
    fn exit_wakes_the_parked_parent_and_reclaims_the_slot() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let free_before = heap.total_free_bytes() + mem.frames.free_frames() * 4096;
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        assert_eq!(sched.process(0).state, ProcessState::Parked);

        let mut frame = Registers::default();
        sched.schedule(&mut mem, &mut heap, &mut frame);
        assert_eq!(sched.current_process_id(), a);

        sched.exit(&mut mem, &mut heap, &mut frame);
        assert_eq!(sched.current_process_id(), 0);
        assert_eq!(sched.process(a).state, ProcessState::Exited);

        // Next pass reclaims the slot and its stack.
        tick(&mut sched, &mut mem, &mut heap);
        assert_eq!(sched.process(a).state, ProcessState::Dead);
        let free_after = heap.total_free_bytes() + mem.frames.free_frames() * 4096;
        assert_eq!(free_after, free_before);
    }

    #[test]
    fn kill_defers_the_switch_to_the_next_tick() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        let b = sched.spawn(&mut mem, &mut heap, 0x3000, "b", false).unwrap();

        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
        assert!(sched.kill(b));
        // b never runs again; its slot is reclaimed on the next pass.
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
        assert_eq!(sched.process(b).state, ProcessState::Dead);

        assert!(!sched.kill(b));
        assert!(!sched.kill(0));
    }

    #[test]
    fn user_process_gets_its_own_space_and_stack() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let u = sched.spawn(&mut mem, &mut heap, 0x5000, "shell", true).unwrap();

        let process = sched.process(u);
        assert!(process.is_user);
        assert!(process.event_queue.is_some());
        assert_eq!(process.context.cs, USER_CS);
        assert_eq!(process.context.useresp, USER_STACK_TOP);

        let space = sched.address_space_mut(u).unwrap();
        assert!(space
            .translate(USER_STACK_TOP - STACK_SIZE as u32)
            .is_ok());
        assert!(space.translate(USER_STACK_TOP).is_err());
    }

    #[test]
    fn spawn_reports_exhausted_slots() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        for process in sched.processes.iter_mut().skip(1) {
            process.state = ProcessState::Ready;
        }
        assert_eq!(
            sched.spawn(&mut mem, &mut heap, 0x2000, "x", false),
            Err(SchedulerError::NoFreeSlot)
        );
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let (mut mem, mut heap, mut sched, _) = fixture();
        let a = sched.spawn(&mut mem, &mut heap, 0x2000, "a", false).unwrap();
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), a);
        sched.sleep(BASE_PERIOD_TICKS * 10);
        // Parent is parked, a is asleep: only idle is left.
        assert_eq!(tick(&mut sched, &mut mem, &mut heap), 0);
    }
}
