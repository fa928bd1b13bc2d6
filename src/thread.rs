//! # Thread Control Block
//!
//! Defines the thread model for Kestrel. Each thread is one cooperative
//! execution context with its own stack, a scheduling priority and a
//! pair of link fields that realize the kernel's intrusive lists on top
//! of a fixed arena of thread records.
//!
//! ## Linkage Model
//!
//! Thread records are never moved once created; they are addressed by
//! [`ThreadId`], the index of their slot in the scheduler's arena. Two
//! independent links hang off every record:
//!
//! - `next` chains the thread into *at most one* queue at a time: the
//!   run queue while it is runnable, or the wait queue of the event it
//!   is blocked on. `queue` names that queue.
//! - `list_next` chains the thread into the global thread list for its
//!   whole lifetime, independent of which queue it currently occupies.
//!   The scheduler's execution pass walks this list to convert deferred
//!   interrupt signals and to reap killed threads.

use crate::config::STACK_SIZE;
use crate::queue::QueueId;
use crate::timer::TimerId;

// ---------------------------------------------------------------------------
// Handles and entry type
// ---------------------------------------------------------------------------

/// Stable handle to a thread record: the index of its arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub(crate) u8);

impl ThreadId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Thread entry point. The argument is the pointer passed at creation,
/// planted in the R0 slot of the initial stack frame.
pub type ThreadEntry = extern "C" fn(*mut ()) -> !;

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///   ┌──────────┐    becomes run-queue head    ┌─────────┐
///   │  Ready   │ ───────────────────────────► │ Running │
///   └──────────┘                              └─────────┘
///        ▲                                         │
///        │        loses run-queue head             │
///        └─────────────────────────────────────────┤
///        │                                         │
///        │        event or timeout fires           ▼
///        │                                    ┌──────────┐
///        └─────────────────────────────────── │ Sleeping │
///                                             └──────────┘
/// ```
///
/// Any state may transition to `Killed` on an exit request; killed
/// threads are detached and their slots freed by the scheduler's reap
/// step once they are no longer the running thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Blocked on a wait queue inside `event_wait`.
    Sleeping,
    /// Currently executing on the CPU.
    Running,
    /// Runnable, queued on the run queue.
    Ready,
    /// Exit requested; awaiting reaping.
    Killed,
}

/// Timeout-timer attachment of a blocked thread.
///
/// `Expired` is the marker the timeout handler leaves behind so that a
/// waking `event_wait` can tell a timeout apart from a genuine signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimer {
    /// No timeout armed; the wait is unbounded.
    None,
    /// A one-shot timer is pending for this wait.
    Armed(TimerId),
    /// The timeout fired before the event arrived.
    Expired,
}

// ---------------------------------------------------------------------------
// Stack storage
// ---------------------------------------------------------------------------

/// Per-thread stack memory, aligned to 8 bytes as required by the ARM
/// AAPCS. Lives inline in the thread record so that slot allocation and
/// stack allocation are one and the same.
#[repr(align(8))]
pub struct ThreadStack(pub [u8; STACK_SIZE]);

impl ThreadStack {
    pub const EMPTY: Self = Self([0u8; STACK_SIZE]);

    /// Base address of the stack region.
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Size of the stack region in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        STACK_SIZE
    }
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block (TCB), the central record for each thread.
///
/// TCBs are stored in a fixed arena inside the scheduler - no heap
/// allocation. A slot with `active == false` is free and may be handed
/// out by the next thread creation.
pub struct ThreadControlBlock {
    /// Thread name, for diagnostics. Uniqueness is caller discipline.
    pub name: &'static str,

    /// Unique serial number, assigned monotonically at creation so that
    /// ids stay distinct across slot reuse.
    pub id: u16,

    /// Scheduling priority. The lower the value the more important the
    /// thread.
    pub priority: u8,

    /// Current execution state.
    pub state: ThreadState,

    /// Event counter: buffered interrupt-context signals, drained one
    /// unit per scheduler execution pass. Only ever nonzero on a thread
    /// at the head of a queue (or freshly credited by head propagation).
    pub ec: u8,

    /// Link into the queue named by `queue`. A thread is a member of at
    /// most one queue at a time.
    pub next: Option<ThreadId>,

    /// The queue this thread currently sits in, if any.
    pub queue: Option<QueueId>,

    /// Link into the global thread list. Valid for the thread's whole
    /// lifetime.
    pub list_next: Option<ThreadId>,

    /// Timeout timer attached to the current wait, if any.
    pub timer: WaitTimer,

    /// Saved stack pointer. Updated on every context switch; points
    /// into `stack`.
    pub sp: *mut u32,

    /// The thread's stack region.
    pub stack: ThreadStack,

    /// Whether this slot is allocated (true) or free (false).
    pub active: bool,
}

// Safety: ThreadControlBlock contains a raw pointer (sp) but it always
// points into the record's own stack array. TCBs are only accessed
// within critical sections.
unsafe impl Send for ThreadControlBlock {}
unsafe impl Sync for ThreadControlBlock {}

impl ThreadControlBlock {
    /// A free, unallocated slot. Used to initialize the arena.
    pub const EMPTY: Self = Self {
        name: "",
        id: 0,
        priority: 0,
        state: ThreadState::Killed,
        ec: 0,
        next: None,
        queue: None,
        list_next: None,
        timer: WaitTimer::None,
        sp: core::ptr::null_mut(),
        stack: ThreadStack::EMPTY,
        active: false,
    };
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
