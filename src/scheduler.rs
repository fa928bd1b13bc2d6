//! # Scheduler
//!
//! Core scheduling logic for Kestrel: the thread arena, the run queue,
//! the global thread list and the execution pass that ties the event
//! and timer subsystems together.
//!
//! ## Scheduling Model
//!
//! Cooperative with interrupt preemption. Exactly one thread executes
//! at a time; a thread leaves the CPU only at explicit suspension
//! points (`event_wait`, `yield_now`, `exec`). The run queue is kept
//! sorted by ascending priority value, so its head is by construction
//! the thread that should be running; a context switch is requested
//! only when the head differs from the current thread.
//!
//! ## The Execution Pass
//!
//! [`Scheduler::exec`] is the full scheduling pass, required whenever
//! queues were restructured:
//!
//! 1. Walk the global thread list once and convert buffered
//!    interrupt-context signals (event counters) into real wake-ups,
//!    one unit per thread per pass.
//! 2. Process the virtual timer list if the tick counter advanced.
//! 3. Request the context switch if the current thread lost the run
//!    queue head position.
//! 4. Reap killed threads.
//!
//! [`Scheduler::yield_now`] is the lightweight variant for the common
//! case where no queue was restructured: it rotates the caller behind
//! its equal-priority peers and re-checks the head, nothing more.

use crate::arch;
use crate::config::{DEFAULT_PRIORITY, IDLE_PRIORITY, MAX_THREADS, MAX_WAIT_QUEUES, STACK_SIZE};
use crate::queue::{self, QueueId, QueueState};
use crate::thread::{ThreadControlBlock, ThreadEntry, ThreadId, ThreadState, WaitTimer};
use crate::timer::{TimerHandler, TimerId, TimerKind, TimerTable};
use crate::Error;

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// The whole of the kernel's mutable state: thread arena, queue table,
/// timer table and bookkeeping. The singleton instance lives behind the
/// critical-section API in the `kernel` module; unit tests construct
/// their own instances directly.
pub struct Scheduler {
    /// Fixed arena of thread records, addressed by [`ThreadId`].
    pub(crate) threads: [ThreadControlBlock; MAX_THREADS],

    /// Queue head cells. Index 0 is the run queue, index 1 the internal
    /// sleep queue; the rest are handed out by `queue_create`.
    pub(crate) queues: [QueueState; MAX_WAIT_QUEUES],

    /// Number of allocated queue cells (including the reserved two).
    queue_count: usize,

    /// Virtual timer arena and pending list.
    pub(crate) timers: TimerTable,

    /// The thread currently executing on the CPU.
    pub(crate) current: Option<ThreadId>,

    /// Head of the global thread list, linked through `list_next`.
    thread_list: Option<ThreadId>,

    /// Monotonic system tick counter, incremented by the SysTick
    /// interrupt.
    ticks: u32,

    /// Tick count as of the last timer-processing pass.
    last_processed: u32,

    /// Source of unique thread serial numbers.
    next_serial: u16,
}

impl Scheduler {
    /// Create an empty scheduler. The run queue and the sleep queue are
    /// pre-allocated; everything else is free.
    pub const fn new() -> Self {
        Self {
            threads: [ThreadControlBlock::EMPTY; MAX_THREADS],
            queues: [QueueState::Empty; MAX_WAIT_QUEUES],
            queue_count: 2,
            timers: TimerTable::new(),
            current: None,
            thread_list: None,
            ticks: 0,
            last_processed: 0,
            next_serial: 0,
        }
    }

    /// Initialise scheduling: create the reserved idle thread and make
    /// it the current thread. The idle thread receives the application
    /// main entry point as its argument and creates the main thread on
    /// first dispatch.
    pub fn init(&mut self, main: ThreadEntry) -> Result<ThreadId, Error> {
        let idle = self.thread_create("idle", idle_thread, main as usize as *mut (), IDLE_PRIORITY)?;
        self.current = Some(idle);
        Ok(idle)
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Create a thread and make it runnable.
    ///
    /// Allocates an arena slot (stack included), builds the initial
    /// stack frame so the first dispatch enters `entry` with `arg` in
    /// R0, links the thread into the global thread list and enqueues it
    /// on the run queue by priority.
    ///
    /// # Returns
    /// - `Ok(id)` - the new thread's handle
    /// - `Err(Error::OutOfMemory)` - the arena is full; nothing was
    ///   allocated
    pub fn thread_create(
        &mut self,
        name: &'static str,
        entry: ThreadEntry,
        arg: *mut (),
        priority: u8,
    ) -> Result<ThreadId, Error> {
        let slot = (0..MAX_THREADS)
            .find(|&i| !self.threads[i].active)
            .ok_or(Error::OutOfMemory)?;
        let tid = ThreadId(slot as u8);

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let list_head = self.thread_list;

        let t = &mut self.threads[slot];
        t.active = true;
        t.name = name;
        t.id = serial;
        t.priority = priority;
        t.state = ThreadState::Ready;
        t.ec = 0;
        t.next = None;
        t.queue = None;
        t.timer = WaitTimer::None;
        t.list_next = list_head;
        init_thread_stack(t, entry, arg);

        self.thread_list = Some(tid);
        self.enqueue(QueueId::RUN, tid);
        Ok(tid)
    }

    /// Terminate the calling thread. It is taken off the run queue,
    /// marked killed and scheduled away from; a later execution pass
    /// reaps the record once another thread is current.
    pub fn thread_exit_current(&mut self) {
        let Some(cur) = self.current else {
            return;
        };
        self.dequeue(QueueId::RUN, cur);
        self.threads[cur.index()].state = ThreadState::Killed;
        self.exec();
    }

    /// Free every killed thread that is no longer current: detach from
    /// the global thread list and release the arena slot (which is the
    /// stack allocation).
    fn reap(&mut self) {
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.thread_list;
        while let Some(tid) = cursor {
            let next = self.threads[tid.index()].list_next;
            if self.threads[tid.index()].state == ThreadState::Killed && Some(tid) != self.current
            {
                match prev {
                    Some(p) => self.threads[p.index()].list_next = next,
                    None => self.thread_list = next,
                }
                self.threads[tid.index()].list_next = None;
                self.threads[tid.index()].active = false;
            } else {
                prev = Some(tid);
            }
            cursor = next;
        }
    }

    // -----------------------------------------------------------------------
    // Queue plumbing
    // -----------------------------------------------------------------------

    /// Allocate a wait-queue head cell for an event source.
    pub fn queue_create(&mut self) -> Result<QueueId, Error> {
        if self.queue_count >= MAX_WAIT_QUEUES {
            return Err(Error::OutOfMemory);
        }
        let id = QueueId(self.queue_count as u8);
        self.queues[id.index()] = QueueState::Empty;
        self.queue_count += 1;
        Ok(id)
    }

    pub(crate) fn enqueue(&mut self, q: QueueId, tid: ThreadId) {
        let Self {
            threads, queues, ..
        } = self;
        queue::enqueue_by_priority(threads, &mut queues[q.index()], q, tid);
    }

    pub(crate) fn dequeue(&mut self, q: QueueId, tid: ThreadId) {
        let Self {
            threads, queues, ..
        } = self;
        queue::remove(threads, &mut queues[q.index()], tid);
    }

    pub(crate) fn pop_head(&mut self, q: QueueId) -> Option<ThreadId> {
        let Self {
            threads, queues, ..
        } = self;
        queue::pop_head(threads, &mut queues[q.index()])
    }

    // -----------------------------------------------------------------------
    // Timers and ticks
    // -----------------------------------------------------------------------

    /// Called from the SysTick handler once per system tick.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
    }

    /// The monotonic system tick counter.
    pub fn sys_ticks(&self) -> u32 {
        self.ticks
    }

    /// Create a virtual timer firing `ticks` from now.
    pub fn timer_create(
        &mut self,
        ticks: u32,
        handler: TimerHandler,
        arg: usize,
        kind: TimerKind,
    ) -> Result<TimerId, Error> {
        self.timers.create(ticks, handler, arg, kind)
    }

    /// Stop and release a timer before it fires.
    pub fn timer_stop(&mut self, id: TimerId) {
        self.timers.stop(id);
    }

    // -----------------------------------------------------------------------
    // Scheduling decisions
    // -----------------------------------------------------------------------

    /// The full scheduling pass. See the module documentation for the
    /// step ordering. Safe to call from any thread context; the actual
    /// context switch is deferred to the architecture port.
    pub fn exec(&mut self) {
        // 1. Convert buffered interrupt signals into wake-ups. This is
        // the only bridge between interrupt context (which may not
        // touch queue chains) and queue mutation. One unit per thread
        // per pass bounds the work done under a single pass.
        let mut cursor = self.thread_list;
        while let Some(tid) = cursor {
            cursor = self.threads[tid.index()].list_next;
            if self.threads[tid.index()].ec == 0 {
                continue;
            }
            let Some(q) = self.threads[tid.index()].queue else {
                continue;
            };
            self.threads[tid.index()].ec -= 1;
            if self.queues[q.index()] != QueueState::Signaled {
                self.event_signal_raw(q);
            }
        }

        // 2. Process virtual timers for however many ticks elapsed
        // since the last pass.
        let now = self.ticks;
        if now != self.last_processed {
            let mut left = now.wrapping_sub(self.last_processed);
            while let Some(fired) = self.timers.advance(&mut left) {
                if let Some(handler) = fired.handler {
                    handler(self, fired.id, fired.arg);
                }
                self.timers.retire(fired.id);
            }
            self.last_processed = now;
        }

        // 3. Switch if the current thread lost the top position.
        if let QueueState::Head(head) = self.queues[QueueId::RUN.index()] {
            if Some(head) != self.current {
                if let Some(cur) = self.current {
                    if self.threads[cur.index()].state == ThreadState::Running {
                        self.threads[cur.index()].state = ThreadState::Ready;
                    }
                }
                arch::trigger_context_switch();
            }
        }

        // 4. Reap killed threads.
        self.reap();
    }

    /// Lightweight relinquish for when no queue was restructured.
    ///
    /// Rotates the caller behind its equal-priority peers in the run
    /// queue and requests a switch if somebody else now stands at the
    /// head. No signal draining, no timer processing.
    pub fn yield_now(&mut self) {
        let Some(cur) = self.current else {
            return;
        };
        if self.threads[cur.index()].queue == Some(QueueId::RUN) {
            self.dequeue(QueueId::RUN, cur);
            self.enqueue(QueueId::RUN, cur);
        }
        if let QueueState::Head(head) = self.queues[QueueId::RUN.index()] {
            if head != cur {
                if self.threads[cur.index()].state == ThreadState::Running {
                    self.threads[cur.index()].state = ThreadState::Ready;
                }
                arch::trigger_context_switch();
            }
        }
    }

    /// The thread currently holding the CPU.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    // -----------------------------------------------------------------------
    // Context-switch hooks (called by the architecture port)
    // -----------------------------------------------------------------------

    /// Record the outgoing thread's stack pointer at the start of a
    /// context switch.
    pub fn store_stack_pointer(&mut self, sp: *mut u32) {
        if let Some(cur) = self.current {
            self.threads[cur.index()].sp = sp;
        }
    }

    /// Complete a context switch decision: promote the run-queue head
    /// to current/`Running` and hand back its saved stack pointer.
    pub fn switch_to_head(&mut self) -> *mut u32 {
        if let QueueState::Head(head) = self.queues[QueueId::RUN.index()] {
            self.current = Some(head);
            self.threads[head.index()].state = ThreadState::Running;
            return self.threads[head.index()].sp;
        }
        match self.current {
            Some(cur) => self.threads[cur.index()].sp,
            None => core::ptr::null_mut(),
        }
    }
}

// ---------------------------------------------------------------------------
// Idle thread
// ---------------------------------------------------------------------------

/// Body of the reserved idle thread.
///
/// On first dispatch it creates the application's main thread, handing
/// over the entry point it received as its argument. Thereafter it
/// keeps running the full scheduling pass so buffered interrupt
/// signals, timers and reaping make progress while every other thread
/// sleeps.
extern "C" fn idle_thread(arg: *mut ()) -> ! {
    let main: ThreadEntry = unsafe { core::mem::transmute(arg) };
    let _ = crate::kernel::thread_create("main", main, core::ptr::null_mut(), DEFAULT_PRIORITY);
    loop {
        crate::kernel::exec();
    }
}

// ---------------------------------------------------------------------------
// Stack initialization
// ---------------------------------------------------------------------------

/// Initialize a thread's stack frame for its first dispatch.
///
/// The Cortex-M4 hardware automatically pushes an exception frame on
/// interrupt entry. We pre-populate this frame on the thread's stack so
/// that the first context-switch "return" starts executing the entry
/// function with the creation argument in R0.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]   <- initial PSP points here
///   xPSR  (Thumb bit set)
///   PC    (thread entry point)
///   LR    (thread_return_trap)
///   R12   (0)
///   R3    (0)
///   R2    (0)
///   R1    (0)
///   R0    (thread argument)
/// [Software saved context]
///   R11..R4 (0)              <- sp after init
/// ```
fn init_thread_stack(tcb: &mut ThreadControlBlock, entry: ThreadEntry, arg: *mut ()) {
    let stack_top = tcb.stack.base() as usize + STACK_SIZE;
    // Align to 8 bytes (AAPCS requirement)
    let aligned_top = stack_top & !0x07;

    // Space for 16 registers (8 HW + 8 SW)
    let frame_ptr = (aligned_top - 16 * 4) as *mut u32;

    unsafe {
        // Software-saved registers (R4-R11)
        for i in 0..8 {
            *frame_ptr.add(i) = 0;
        }

        // Hardware-stacked frame (R0-R3, R12, LR, PC, xPSR)
        *frame_ptr.add(8) = arg as usize as u32; // R0 - thread argument
        *frame_ptr.add(9) = 0; // R1
        *frame_ptr.add(10) = 0; // R2
        *frame_ptr.add(11) = 0; // R3
        *frame_ptr.add(12) = 0; // R12
        *frame_ptr.add(13) = thread_return_trap as usize as u32; // LR
        *frame_ptr.add(14) = entry as usize as u32; // PC
        *frame_ptr.add(15) = 0x0100_0000; // xPSR - Thumb bit set
    }

    tcb.sp = frame_ptr;
}

/// Landing pad if a thread entry ever returns (it cannot, entries are
/// `-> !`). Requests a normal exit so the slot is reclaimed.
extern "C" fn thread_return_trap() -> ! {
    crate::kernel::thread_exit();
    loop {}
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) extern "C" fn parked_entry(_: *mut ()) -> ! {
        loop {}
    }

    pub(crate) fn spawn(sched: &mut Scheduler, name: &'static str, prio: u8) -> ThreadId {
        sched
            .thread_create(name, parked_entry, core::ptr::null_mut(), prio)
            .unwrap()
    }

    /// Pretend `tid` was context-switched in, without going through the
    /// architecture port.
    pub(crate) fn ready_thread(sched: &mut Scheduler, tid: ThreadId) {
        sched.current = Some(tid);
        sched.threads[tid.index()].state = ThreadState::Running;
    }

    #[test]
    fn run_queue_orders_by_priority_with_fifo_ties() {
        let mut sched = Scheduler::new();
        let b = spawn(&mut sched, "b", 5);
        let c = spawn(&mut sched, "c", 5);
        let a = spawn(&mut sched, "a", 1);

        assert_eq!(sched.queues[QueueId::RUN.index()], QueueState::Head(a));
        assert_eq!(sched.threads[a.index()].next, Some(b));
        assert_eq!(sched.threads[b.index()].next, Some(c));
        assert_eq!(sched.threads[c.index()].next, None);
    }

    #[test]
    fn init_reserves_the_idle_thread() {
        let mut sched = Scheduler::new();
        let idle = sched.init(parked_entry).unwrap();

        assert_eq!(sched.current, Some(idle));
        assert_eq!(sched.threads[idle.index()].priority, IDLE_PRIORITY);
        assert_eq!(sched.threads[idle.index()].name, "idle");
        assert_eq!(sched.queues[QueueId::RUN.index()], QueueState::Head(idle));
    }

    #[test]
    fn exec_demotes_a_displaced_running_thread() {
        let mut sched = Scheduler::new();
        let lo = spawn(&mut sched, "lo", 9);
        ready_thread(&mut sched, lo);

        let hi = spawn(&mut sched, "hi", 1);
        sched.exec();

        assert_eq!(sched.threads[lo.index()].state, ThreadState::Ready);
        let sp = sched.switch_to_head();
        assert_eq!(sched.current, Some(hi));
        assert_eq!(sched.threads[hi.index()].state, ThreadState::Running);
        assert_eq!(sp, sched.threads[hi.index()].sp);
    }

    #[test]
    fn exec_leaves_the_top_thread_in_place() {
        let mut sched = Scheduler::new();
        let hi = spawn(&mut sched, "hi", 1);
        spawn(&mut sched, "lo", 9);
        ready_thread(&mut sched, hi);

        sched.exec();
        assert_eq!(sched.threads[hi.index()].state, ThreadState::Running);
        assert_eq!(sched.current, Some(hi));
    }

    #[test]
    fn yield_rotates_equal_priority_peers() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        let b = spawn(&mut sched, "b", 5);
        ready_thread(&mut sched, a);

        sched.yield_now();

        assert_eq!(sched.queues[QueueId::RUN.index()], QueueState::Head(b));
        assert_eq!(sched.threads[a.index()].state, ThreadState::Ready);
        assert_eq!(sched.threads[b.index()].next, Some(a));
    }

    #[test]
    fn yield_keeps_a_strictly_superior_thread_running() {
        let mut sched = Scheduler::new();
        let hi = spawn(&mut sched, "hi", 1);
        spawn(&mut sched, "lo", 9);
        ready_thread(&mut sched, hi);

        sched.yield_now();

        assert_eq!(sched.queues[QueueId::RUN.index()], QueueState::Head(hi));
        assert_eq!(sched.threads[hi.index()].state, ThreadState::Running);
    }

    #[test]
    fn exit_reaps_only_after_the_thread_is_switched_away_from() {
        let mut sched = Scheduler::new();
        let idle = sched.init(parked_entry).unwrap();
        let a = spawn(&mut sched, "a", 5);
        sched.switch_to_head();
        assert_eq!(sched.current, Some(a));

        sched.thread_exit_current();

        // Still current: the record (and stack) must survive this pass.
        assert!(sched.threads[a.index()].active);
        assert_eq!(sched.threads[a.index()].state, ThreadState::Killed);

        sched.switch_to_head();
        assert_eq!(sched.current, Some(idle));
        sched.exec();

        assert!(!sched.threads[a.index()].active);
        assert_eq!(sched.thread_list, Some(idle));
        assert_eq!(sched.threads[idle.index()].list_next, None);
    }

    #[test]
    fn freed_slots_are_reused_with_fresh_serials() {
        let mut sched = Scheduler::new();
        sched.init(parked_entry).unwrap();
        let a = spawn(&mut sched, "a", 5);
        let first_serial = sched.threads[a.index()].id;

        sched.switch_to_head();
        sched.thread_exit_current();
        sched.switch_to_head();
        sched.exec();

        let b = spawn(&mut sched, "b", 5);
        assert_eq!(a, b); // same arena slot
        assert_ne!(sched.threads[b.index()].id, first_serial);
    }

    #[test]
    fn thread_arena_exhaustion_reports_out_of_memory() {
        let mut sched = Scheduler::new();
        for i in 0..MAX_THREADS {
            assert!(sched.thread_create("t", parked_entry, core::ptr::null_mut(), i as u8).is_ok());
        }
        assert_eq!(
            sched.thread_create("t", parked_entry, core::ptr::null_mut(), 0),
            Err(Error::OutOfMemory)
        );
    }

    #[test]
    fn queue_table_exhaustion_reports_out_of_memory() {
        let mut sched = Scheduler::new();
        for _ in 0..MAX_WAIT_QUEUES - 2 {
            sched.queue_create().unwrap();
        }
        assert_eq!(sched.queue_create(), Err(Error::OutOfMemory));
    }

    #[test]
    fn ticks_accumulate_and_timers_fire_from_exec() {
        fn poke(sched: &mut Scheduler, _t: TimerId, arg: usize) {
            sched.event_signal_raw(QueueId(arg as u8));
        }

        let mut sched = Scheduler::new();
        let q = sched.queue_create().unwrap();
        sched.timer_create(3, poke, q.index(), TimerKind::OneShot).unwrap();

        sched.tick();
        sched.tick();
        sched.exec();
        assert_eq!(sched.sys_ticks(), 2);
        assert_eq!(sched.queues[q.index()], QueueState::Empty);

        sched.tick();
        sched.exec();
        assert_eq!(sched.queues[q.index()], QueueState::Signaled);
    }

    #[test]
    fn initial_stack_frame_carries_entry_and_argument() {
        let mut sched = Scheduler::new();
        let arg = 0x1234 as *mut ();
        let tid = sched
            .thread_create("t", parked_entry, arg, 5)
            .unwrap();

        let sp = sched.threads[tid.index()].sp;
        assert_eq!(sp as usize % 8, 0);
        unsafe {
            assert_eq!(*sp.add(8), 0x1234); // R0
            assert_eq!(*sp.add(14), parked_entry as usize as u32); // PC
            assert_eq!(*sp.add(15), 0x0100_0000); // xPSR
        }
    }
}
