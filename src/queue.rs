//! # Thread Priority Queues
//!
//! Ordered insertion and removal of thread handles into arbitrary
//! queues: the run queue and every per-event wait queue use the same
//! algorithms, operating on a queue head cell plus the thread arena.
//!
//! ## Queue Head Cell
//!
//! A queue is nothing more than a head cell holding a [`QueueState`]:
//!
//! - `Empty`: no thread waiting, no signal pending.
//! - `Signaled`: an event fired with nobody waiting; the next waiter
//!   proceeds immediately instead of blocking.
//! - `Head(id)`: a chain of blocked threads linked through their `next`
//!   fields, sorted by ascending priority value (most important first).
//!   Ties preserve arrival order, so equal-priority threads leave the
//!   queue in FIFO order.
//!
//! ## Event-Counter Bookkeeping
//!
//! Deferred interrupt signals are counted on the thread at the head of
//! a queue (see the event module). Whenever insertion or removal changes
//! which thread stands at a given position, the unconsumed count must
//! follow the position, never the thread: a new head inherits the old
//! head's credit, and a removed thread bequeaths its credit to its
//! successor.

use crate::config::MAX_THREADS;
use crate::thread::{ThreadControlBlock, ThreadId};

// ---------------------------------------------------------------------------
// Queue identity and head-cell state
// ---------------------------------------------------------------------------

/// Handle to a queue head cell in the scheduler's queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId(pub(crate) u8);

impl QueueId {
    /// The run queue: the priority-ordered list of runnable threads.
    pub(crate) const RUN: QueueId = QueueId(0);

    /// Internal queue that sleeping threads park on. Never signaled;
    /// sleepers leave it through their timeout timers.
    pub(crate) const SLEEP: QueueId = QueueId(1);

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// State of a queue head cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No thread waiting and no signal pending.
    Empty,
    /// An event fired with nobody waiting.
    Signaled,
    /// Head of a priority-ordered chain of threads.
    Head(ThreadId),
}

// ---------------------------------------------------------------------------
// Priority-ordered insertion
// ---------------------------------------------------------------------------

/// Insert `tid` into the priority-sorted queue behind `cell`.
///
/// The insertion point is after every member whose priority value is
/// less than or equal to the new thread's, so more important threads
/// stay in front and equal-priority threads keep FIFO order.
///
/// If the cell holds `Signaled`, the thread is inserted as if the queue
/// were empty but with its event counter pre-credited by one: the event
/// already happened before anyone was waiting, and the scheduler's next
/// pass will convert that credit into a wake-up.
///
/// If the inserted thread ends up in front of a member carrying pending
/// event credit, the credit transfers to the new arrival (credit belongs
/// to the queue position, not the thread).
///
/// Must not be called for a thread that is already a member of some
/// queue; membership in at most one queue is caller discipline, not a
/// runtime check.
pub(crate) fn enqueue_by_priority(
    threads: &mut [ThreadControlBlock; MAX_THREADS],
    cell: &mut QueueState,
    queue: QueueId,
    tid: ThreadId,
) {
    threads[tid.index()].ec = 0;
    threads[tid.index()].queue = Some(queue);

    match *cell {
        QueueState::Signaled => {
            threads[tid.index()].ec = 1;
            threads[tid.index()].next = None;
            *cell = QueueState::Head(tid);
        }
        QueueState::Empty => {
            threads[tid.index()].next = None;
            *cell = QueueState::Head(tid);
        }
        QueueState::Head(head) => {
            let prio = threads[tid.index()].priority;
            if threads[head.index()].priority > prio {
                // New most-important thread: becomes the head.
                threads[tid.index()].next = Some(head);
                *cell = QueueState::Head(tid);
            } else {
                // Walk past every member with priority <= prio.
                let mut prev = head;
                while let Some(n) = threads[prev.index()].next {
                    if threads[n.index()].priority > prio {
                        break;
                    }
                    prev = n;
                }
                threads[tid.index()].next = threads[prev.index()].next;
                threads[prev.index()].next = Some(tid);
            }
            inherit_successor_credit(threads, tid);
        }
    }
}

/// Transfer pending event credit from the new thread's successor, if
/// any. The successor held the credit while it stood at this position.
fn inherit_successor_credit(
    threads: &mut [ThreadControlBlock; MAX_THREADS],
    tid: ThreadId,
) {
    if let Some(succ) = threads[tid.index()].next {
        let pending = threads[succ.index()].ec;
        if pending > 0 {
            threads[tid.index()].ec += pending;
            threads[succ.index()].ec = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

/// Remove `tid` from the queue behind `cell`, wherever it sits.
///
/// The removed thread's pending event credit passes to its successor;
/// its queue links are cleared. No-op if the cell is `Signaled`/`Empty`
/// or the thread is not a member.
pub(crate) fn remove(
    threads: &mut [ThreadControlBlock; MAX_THREADS],
    cell: &mut QueueState,
    tid: ThreadId,
) {
    let QueueState::Head(head) = *cell else {
        return;
    };

    if head == tid {
        *cell = match threads[tid.index()].next {
            Some(n) => QueueState::Head(n),
            None => QueueState::Empty,
        };
    } else {
        // Linear scan for the predecessor.
        let mut prev = head;
        loop {
            match threads[prev.index()].next {
                Some(n) if n == tid => break,
                Some(n) => prev = n,
                None => return, // not a member
            }
        }
        threads[prev.index()].next = threads[tid.index()].next;
    }

    let credit = threads[tid.index()].ec;
    if credit > 0 {
        if let Some(n) = threads[tid.index()].next {
            threads[n.index()].ec = credit;
        }
        threads[tid.index()].ec = 0;
    }

    threads[tid.index()].next = None;
    threads[tid.index()].queue = None;
}

/// Pop the head of the queue behind `cell`.
///
/// The popped thread's pending event credit passes to the new head; if
/// the queue drains while credit is outstanding the cell becomes
/// `Signaled`, so the credit survives as "event pending, nobody
/// waiting". Returns the popped thread with its queue links cleared.
pub(crate) fn pop_head(
    threads: &mut [ThreadControlBlock; MAX_THREADS],
    cell: &mut QueueState,
) -> Option<ThreadId> {
    let QueueState::Head(head) = *cell else {
        return None;
    };

    let credit = threads[head.index()].ec;
    match threads[head.index()].next {
        Some(n) => {
            *cell = QueueState::Head(n);
            if credit > 0 {
                threads[n.index()].ec = credit;
            }
        }
        None => {
            *cell = if credit > 0 {
                QueueState::Signaled
            } else {
                QueueState::Empty
            };
        }
    }

    threads[head.index()].ec = 0;
    threads[head.index()].next = None;
    threads[head.index()].queue = None;
    Some(head)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
