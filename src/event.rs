//! # Event Management
//!
//! Thread synchronization built on wait queues and virtual timers.
//!
//! A thread waits for an event with [`Scheduler::event_wait_prepare`]
//! and its conclude counterpart; another thread wakes it with
//! [`Scheduler::event_signal`]. Interrupt handlers must never touch
//! queue chains - they use [`Scheduler::event_signal_from_isr`], which
//! only flags state that the scheduler's execution pass later converts
//! into real wake-ups.
//!
//! ## Signal-Before-Wait Races
//!
//! A queue head cell remembers a signal that arrived with nobody
//! waiting (`Signaled`), so a waiter can never miss an event that
//! preceded its wait. Conversely a thread that finds the cell already
//! `Signaled` consumes it and returns immediately, yielding once so
//! equally important runnable threads get a chance first.
//!
//! ## Timeouts
//!
//! A timed wait arms a one-shot virtual timer whose handler finds the
//! waiter by timer identity, removes it from the wait queue and marks
//! its timer field `Expired`. The waking wait call reports `Expired` as
//! [`Error::TimedOut`], anything else as success.

use crate::config::WAIT_INFINITE;
use crate::queue::{QueueId, QueueState};
use crate::scheduler::Scheduler;
use crate::thread::{ThreadState, WaitTimer};
use crate::timer::{TimerId, TimerKind};
use crate::Error;

// ---------------------------------------------------------------------------
// Wait outcome
// ---------------------------------------------------------------------------

/// What `event_wait_prepare` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event had already fired; the wait is over without blocking.
    Ready,
    /// The caller was parked on the wait queue and the context switch
    /// has been requested. The wait result must be read with
    /// `event_wait_conclude` after the thread resumes.
    Blocked,
}

// ---------------------------------------------------------------------------
// Event operations
// ---------------------------------------------------------------------------

impl Scheduler {
    /// First half of waiting for an event.
    ///
    /// If the queue is `Signaled` the signal is consumed and the wait
    /// completes immediately. Otherwise the calling thread leaves the
    /// run queue, parks on the wait queue, optionally arms a `timeout`
    /// tick one-shot timer (`WAIT_INFINITE` waits forever) and runs the
    /// full scheduler pass to switch away. A plain yield is not enough
    /// here: the queues were restructured and must be re-evaluated.
    ///
    /// Fails with [`Error::OutOfMemory`] when no timer slot is free for
    /// a timed wait; the caller is not enqueued in that case.
    pub fn event_wait_prepare(
        &mut self,
        q: QueueId,
        timeout: u32,
    ) -> Result<WaitOutcome, Error> {
        if self.queues[q.index()] == QueueState::Signaled {
            self.queues[q.index()] = QueueState::Empty;
            // Give other runnable threads of equal rank a chance.
            self.yield_now();
            return Ok(WaitOutcome::Ready);
        }

        let Some(cur) = self.current else {
            return Ok(WaitOutcome::Ready);
        };

        // Arm the timeout first so an allocation failure leaves no
        // partial state behind.
        let timer = if timeout != WAIT_INFINITE {
            WaitTimer::Armed(self.timers.create(
                timeout,
                wait_timeout_handler,
                q.index(),
                TimerKind::OneShot,
            )?)
        } else {
            WaitTimer::None
        };

        self.dequeue(QueueId::RUN, cur);
        self.enqueue(q, cur);
        self.threads[cur.index()].state = ThreadState::Sleeping;
        self.threads[cur.index()].timer = timer;

        self.exec();
        Ok(WaitOutcome::Blocked)
    }

    /// Like `event_wait_prepare`, but always waits for the *next*
    /// event: a stale `Signaled` cell is cleared instead of consumed.
    pub fn event_wait_next_prepare(
        &mut self,
        q: QueueId,
        timeout: u32,
    ) -> Result<WaitOutcome, Error> {
        if self.queues[q.index()] == QueueState::Signaled {
            self.queues[q.index()] = QueueState::Empty;
        }
        self.event_wait_prepare(q, timeout)
    }

    /// Second half of waiting: classify how the thread was woken.
    /// Runs on the resumed thread, after the context switch back.
    pub fn event_wait_conclude(&mut self) -> Result<(), Error> {
        let Some(cur) = self.current else {
            return Ok(());
        };
        if self.threads[cur.index()].timer == WaitTimer::Expired {
            self.threads[cur.index()].timer = WaitTimer::None;
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    /// Post an event without yielding.
    ///
    /// An empty queue becomes `Signaled` so a future waiter will not
    /// block; an already signaled queue stays signaled. Otherwise the
    /// most important waiter is popped, its timeout timer (if armed) is
    /// cancelled, and it is made runnable again.
    pub fn event_signal_raw(&mut self, q: QueueId) {
        match self.queues[q.index()] {
            QueueState::Signaled => {}
            QueueState::Empty => self.queues[q.index()] = QueueState::Signaled,
            QueueState::Head(_) => {
                if let Some(t) = self.pop_head(q) {
                    if let WaitTimer::Armed(tm) = self.threads[t.index()].timer {
                        self.timers.stop(tm);
                    }
                    self.threads[t.index()].timer = WaitTimer::None;
                    self.threads[t.index()].state = ThreadState::Ready;
                    self.enqueue(QueueId::RUN, t);
                }
            }
        }
    }

    /// Post an event, then yield so the woken thread runs immediately
    /// when it now outranks the caller.
    pub fn event_signal(&mut self, q: QueueId) {
        self.event_signal_raw(q);
        self.yield_now();
    }

    /// Post an event from interrupt context.
    ///
    /// Never touches queue chains, which may be mid-mutation under the
    /// preempted thread. An empty queue is flagged `Signaled`; when a
    /// chain exists the head waiter's event counter is incremented and
    /// the scheduler's next execution pass converts the credit into a
    /// real wake-up. A counter pegged at 255 stays there.
    ///
    /// Only for interrupt handlers; thread code uses `event_signal`.
    pub fn event_signal_from_isr(&mut self, q: QueueId) {
        match self.queues[q.index()] {
            QueueState::Empty => self.queues[q.index()] = QueueState::Signaled,
            QueueState::Signaled => {}
            QueueState::Head(h) => {
                let ec = &mut self.threads[h.index()].ec;
                *ec = ec.saturating_add(1);
            }
        }
    }

    /// Block the calling thread for `ticks` system ticks.
    ///
    /// Parks it on the reserved sleep queue, which nobody ever signals;
    /// the armed timeout is the wake-up. A zero duration degenerates to
    /// a yield.
    pub fn thread_sleep_prepare(&mut self, ticks: u32) -> Result<WaitOutcome, Error> {
        if ticks == 0 {
            self.yield_now();
            return Ok(WaitOutcome::Ready);
        }
        self.event_wait_prepare(QueueId::SLEEP, ticks)
    }
}

// ---------------------------------------------------------------------------
// Timeout handler
// ---------------------------------------------------------------------------

/// Fired when a timed wait elapses. Locates the waiter owning `timer`
/// in the queue the wait was parked on, removes it (its pending event
/// credit follows the queue position), re-queues it on the run queue
/// and tags its timer field `Expired` so the waking wait call reports
/// a timeout instead of a signal.
fn wait_timeout_handler(sched: &mut Scheduler, timer: TimerId, arg: usize) {
    let q = QueueId(arg as u8);

    let QueueState::Head(head) = sched.queues[q.index()] else {
        return;
    };

    // Scan for the thread whose wait armed this timer.
    let mut found = None;
    let mut cur = Some(head);
    while let Some(t) = cur {
        if sched.threads[t.index()].timer == WaitTimer::Armed(timer) {
            found = Some(t);
            break;
        }
        cur = sched.threads[t.index()].next;
    }
    let Some(t) = found else {
        return;
    };

    if t == head {
        // Popping the head converts an orphaned event credit into a
        // Signaled cell rather than losing it.
        sched.pop_head(q);
    } else {
        sched.dequeue(q, t);
    }

    sched.threads[t.index()].state = ThreadState::Ready;
    sched.enqueue(QueueId::RUN, t);
    sched.threads[t.index()].timer = WaitTimer::Expired;
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{ready_thread, spawn};

    #[test]
    fn signal_before_wait_resolves_toward_the_waiter() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();

        sched.event_signal(q);
        assert_eq!(sched.queues[q.index()], QueueState::Signaled);

        let outcome = sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(sched.queues[q.index()], QueueState::Empty);
        assert_eq!(sched.event_wait_conclude(), Ok(()));
    }

    #[test]
    fn wait_next_ignores_a_stale_signal() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();

        sched.event_signal_raw(q);
        let outcome = sched.event_wait_next_prepare(q, WAIT_INFINITE).unwrap();

        assert_eq!(outcome, WaitOutcome::Blocked);
        assert_eq!(sched.queues[q.index()], QueueState::Head(a));
        assert_eq!(sched.threads[a.index()].state, ThreadState::Sleeping);
    }

    #[test]
    fn blocking_wait_parks_and_signal_wakes_by_priority() {
        let mut sched = Scheduler::new();
        let lo = spawn(&mut sched, "lo", 9);
        let hi = spawn(&mut sched, "hi", 2);
        let q = sched.queue_create().unwrap();

        ready_thread(&mut sched, lo);
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();
        ready_thread(&mut sched, hi);
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();

        // Both parked; the more important waiter stands at the head.
        assert_eq!(sched.queues[q.index()], QueueState::Head(hi));

        sched.event_signal(q);
        assert_eq!(sched.threads[hi.index()].state, ThreadState::Ready);
        assert_eq!(sched.threads[hi.index()].queue, Some(QueueId::RUN));
        assert_eq!(sched.queues[q.index()], QueueState::Head(lo));
    }

    #[test]
    fn signal_cancels_the_armed_timeout() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();

        sched.event_wait_prepare(q, 50).unwrap();
        let WaitTimer::Armed(tm) = sched.threads[a.index()].timer else {
            panic!("timeout was not armed");
        };

        sched.event_signal(q);
        assert!(!sched.timers.is_pending(tm));
        assert_eq!(sched.threads[a.index()].timer, WaitTimer::None);
    }

    #[test]
    fn timed_wait_expires_after_exactly_its_timeout() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();

        sched.event_wait_prepare(q, 2).unwrap();

        sched.tick();
        sched.exec();
        assert_eq!(sched.threads[a.index()].state, ThreadState::Sleeping);

        sched.tick();
        sched.exec();

        // Woken by the timeout: back on the run queue, not dangling in
        // the wait queue, and tagged as expired.
        assert_eq!(sched.queues[q.index()], QueueState::Empty);
        assert_eq!(sched.threads[a.index()].state, ThreadState::Ready);
        assert_eq!(sched.threads[a.index()].queue, Some(QueueId::RUN));
        assert_eq!(sched.threads[a.index()].timer, WaitTimer::Expired);

        // Once the thread is switched back in, the wait reports the
        // timeout distinctly.
        sched.switch_to_head();
        assert_eq!(sched.current, Some(a));
        assert_eq!(sched.event_wait_conclude(), Err(Error::TimedOut));
        assert_eq!(sched.threads[a.index()].timer, WaitTimer::None);
    }

    #[test]
    fn isr_signal_without_waiter_sets_signaled() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();

        sched.event_signal_from_isr(q);
        assert_eq!(sched.queues[q.index()], QueueState::Signaled);

        // A later ordinary wait consumes it without blocking.
        let outcome = sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[test]
    fn isr_signals_accumulate_on_the_head_waiter() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);
        let q = sched.queue_create().unwrap();
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();

        for _ in 0..3 {
            sched.event_signal_from_isr(q);
        }
        assert_eq!(sched.threads[a.index()].ec, 3);

        // One execution pass converts the credit into a wake-up; the
        // surplus collapses into a Signaled cell for future waiters.
        sched.exec();
        assert_eq!(sched.threads[a.index()].state, ThreadState::Ready);
        assert_eq!(sched.threads[a.index()].queue, Some(QueueId::RUN));
        assert_eq!(sched.threads[a.index()].ec, 0);
        assert_eq!(sched.queues[q.index()], QueueState::Signaled);
    }

    #[test]
    fn exec_converts_one_credit_per_waiter_per_pass() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        let b = spawn(&mut sched, "b", 6);
        let q = sched.queue_create().unwrap();

        ready_thread(&mut sched, a);
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();
        ready_thread(&mut sched, b);
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();

        sched.event_signal_from_isr(q);
        assert_eq!(sched.threads[a.index()].ec, 1);

        sched.exec();
        assert_eq!(sched.threads[a.index()].state, ThreadState::Ready);
        // Only one wake-up happened: the other waiter still sleeps.
        assert_eq!(sched.threads[b.index()].state, ThreadState::Sleeping);
        assert_eq!(sched.queues[q.index()], QueueState::Head(b));
    }

    #[test]
    fn sleep_parks_on_the_sleep_queue_and_wakes_on_timeout() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, "a", 5);
        ready_thread(&mut sched, a);

        let outcome = sched.thread_sleep_prepare(3).unwrap();
        assert_eq!(outcome, WaitOutcome::Blocked);
        assert_eq!(sched.queues[QueueId::SLEEP.index()], QueueState::Head(a));

        for _ in 0..3 {
            sched.tick();
            sched.exec();
        }
        assert_eq!(sched.threads[a.index()].state, ThreadState::Ready);
        assert_eq!(sched.queues[QueueId::SLEEP.index()], QueueState::Empty);
    }

    #[test]
    fn timeout_of_a_mid_queue_waiter_leaves_the_head_alone() {
        let mut sched = Scheduler::new();
        let hi = spawn(&mut sched, "hi", 2);
        let lo = spawn(&mut sched, "lo", 9);
        let q = sched.queue_create().unwrap();

        ready_thread(&mut sched, hi);
        sched.event_wait_prepare(q, WAIT_INFINITE).unwrap();
        ready_thread(&mut sched, lo);
        sched.event_wait_prepare(q, 2).unwrap();

        assert_eq!(sched.queues[q.index()], QueueState::Head(hi));

        sched.tick();
        sched.tick();
        sched.exec();

        assert_eq!(sched.queues[q.index()], QueueState::Head(hi));
        assert_eq!(sched.threads[hi.index()].state, ThreadState::Sleeping);
        assert_eq!(sched.threads[lo.index()].state, ThreadState::Ready);
        assert_eq!(sched.threads[lo.index()].timer, WaitTimer::Expired);
    }
}
