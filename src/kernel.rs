//! # Kernel
//!
//! Top-level kernel initialization and public API for Kestrel.
//!
//! The kernel manages the global scheduler instance and wraps every
//! entry point in a critical section so thread code and interrupt
//! handlers never race on shared state. All of the logic lives in the
//! `scheduler`, `event` and `timer` modules; this module only adds the
//! singleton and the interrupt masking around it.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init(app_main)  ← Create the idle thread
//!         └─► kernel::start(cp)       ← Launch scheduler (no return)
//!               ├─► Configure SysTick
//!               ├─► Set interrupt priorities
//!               └─► Dispatch the run-queue head
//! ```
//!
//! The idle thread creates the `app_main` thread on its first dispatch,
//! then loops running the scheduler pass forever; it is the fallback
//! runnable when nothing else is ready.

#[cfg(all(target_arch = "arm", target_os = "none"))]
use crate::arch::cortex_m4;
use crate::queue::QueueId;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::thread::{ThreadEntry, ThreadId};
use crate::timer::{TimerHandler, TimerId, TimerKind};
use crate::Error;
use crate::event::WaitOutcome;

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler instance.
///
/// # Safety
/// Accessed via `KERNEL_PTR`, which is set during `init()`. All access
/// is through critical sections or from ISR context (where interrupts
/// are already serialized by priority).
static mut KERNEL: Scheduler = Scheduler::new();

/// Raw pointer to the global scheduler. Used by the arch layer (PendSV,
/// SysTick handlers), which cannot easily use references.
///
/// # Safety
/// Set once during `init()`, read from ISR context.
pub(crate) static mut KERNEL_PTR: *mut Scheduler = core::ptr::null_mut();

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the kernel and create the reserved idle thread.
///
/// `main` is the application entry point; the idle thread creates the
/// "main" thread around it on first dispatch. Must be called exactly
/// once, from the main context, before any other kernel function.
pub fn init(main: ThreadEntry) -> Result<ThreadId, Error> {
    sync::critical_section(|_cs| unsafe {
        KERNEL_PTR = core::ptr::addr_of_mut!(KERNEL);
        (*KERNEL_PTR).init(main)
    })
}

/// Start the scheduler. **Does not return.**
///
/// Configures the SysTick timer, sets interrupt priorities, and
/// dispatches the run-queue head (the idle thread, unless application
/// threads were created beforehand).
///
/// # Safety (caller contract)
/// - `init()` must have been called.
/// - Must be called from the main context, not from an ISR.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities();

    let first_sp = sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).switch_to_head() });

    unsafe { cortex_m4::start_first_thread(first_sp) }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Create a thread and make it runnable.
///
/// # Parameters
/// - `name`: diagnostic name; uniqueness is caller discipline.
/// - `entry`: thread body, entered with `arg` on first dispatch.
/// - `priority`: the lower the value the more important the thread.
///
/// # Returns
/// - `Ok(id)`: the new thread's handle.
/// - `Err(Error::OutOfMemory)`: the thread arena is full.
pub fn thread_create(
    name: &'static str,
    entry: ThreadEntry,
    arg: *mut (),
    priority: u8,
) -> Result<ThreadId, Error> {
    sync::critical_section(|_cs| unsafe {
        (*KERNEL_PTR).thread_create(name, entry, arg, priority)
    })
}

/// Terminate the calling thread. The kernel reclaims its record once
/// another thread has been switched in.
pub fn thread_exit() {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).thread_exit_current() });
}

/// Voluntarily relinquish the CPU, falling behind equal-priority peers.
pub fn yield_now() {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).yield_now() });
}

/// Block the calling thread for `ticks` system ticks. A zero duration
/// degenerates to a yield.
pub fn thread_sleep(ticks: u32) {
    let outcome =
        sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).thread_sleep_prepare(ticks) });
    if outcome == Ok(WaitOutcome::Blocked) {
        // Resumed here after the timeout; the expiry tag is expected.
        let _ = sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_wait_conclude() });
    }
}

/// Run one full scheduling pass: drain deferred interrupt signals,
/// process timers, switch to the run-queue head if it changed, reap
/// killed threads. The idle thread calls this in a loop; drivers rarely
/// need it directly.
pub fn exec() {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).exec() });
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Allocate a wait queue for an event source.
pub fn queue_create() -> Result<QueueId, Error> {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).queue_create() })
}

/// Wait for an event on `q`, at most `timeout` ticks
/// ([`crate::config::WAIT_INFINITE`] waits forever).
///
/// Returns `Ok(())` when the event arrived (including an event that
/// fired before the wait began), `Err(Error::TimedOut)` when the
/// timeout elapsed first, `Err(Error::OutOfMemory)` when no timer slot
/// was free to arm the timeout.
pub fn event_wait(q: QueueId, timeout: u32) -> Result<(), Error> {
    let outcome =
        sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_wait_prepare(q, timeout) })?;
    match outcome {
        WaitOutcome::Ready => Ok(()),
        // The context switch happens between these two critical
        // sections; the conclude step runs on the resumed thread.
        WaitOutcome::Blocked => {
            sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_wait_conclude() })
        }
    }
}

/// Like [`event_wait`], but always waits for the *next* event: a signal
/// already pending on the queue is discarded instead of consumed.
pub fn event_wait_next(q: QueueId, timeout: u32) -> Result<(), Error> {
    let outcome = sync::critical_section(|_cs| unsafe {
        (*KERNEL_PTR).event_wait_next_prepare(q, timeout)
    })?;
    match outcome {
        WaitOutcome::Ready => Ok(()),
        WaitOutcome::Blocked => {
            sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_wait_conclude() })
        }
    }
}

/// Post an event to `q` and yield, so the woken thread runs immediately
/// if it outranks the caller.
pub fn event_signal(q: QueueId) {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_signal(q) });
}

/// Post an event to `q` from an interrupt handler.
///
/// This is the only signal path permitted in interrupt context: it
/// never touches queue chains, it only flags state that the next
/// scheduling pass converts into a wake-up. Thread code uses
/// [`event_signal`] instead.
pub fn event_signal_from_isr(q: QueueId) {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).event_signal_from_isr(q) });
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Create a virtual timer firing `ticks` from now. The callback runs in
/// scheduler context during a later execution pass, never in interrupt
/// context.
pub fn timer_create(
    ticks: u32,
    handler: TimerHandler,
    arg: usize,
    kind: TimerKind,
) -> Result<TimerId, Error> {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).timer_create(ticks, handler, arg, kind) })
}

/// Stop and release a timer before it fires.
pub fn timer_stop(id: TimerId) {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).timer_stop(id) });
}

/// The monotonic system tick counter.
pub fn sys_ticks() -> u32 {
    sync::critical_section(|_cs| unsafe { (*KERNEL_PTR).sys_ticks() })
}
