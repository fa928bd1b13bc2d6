//! # Virtual Timers
//!
//! Software timers scheduled by relative tick delta, independent of any
//! specific hardware timer channel. Timed waits and thread sleeps are
//! the kernel's own clients; drivers may create timers for their own
//! deferred work.
//!
//! ## Delta Encoding
//!
//! The pending timers form a single list ordered by deadline, where
//! each node stores the tick delta from its predecessor rather than an
//! absolute deadline. Summing `ticks_left` from the head to a node
//! yields the absolute number of ticks until that node fires, so a
//! tick only ever decrements the head and insertion is a single pass:
//!
//! ```text
//!  head ──► [3] ──► [2] ──► [5]        absolute deadlines 3, 5, 10
//! ```
//!
//! Timers live in a fixed arena; [`TimerId`] is the slot index. The
//! creating caller owns the handle until the timer fires (one-shot) or
//! is stopped.

use crate::config::MAX_TIMERS;
use crate::scheduler::Scheduler;
use crate::Error;

// ---------------------------------------------------------------------------
// Handles and callback type
// ---------------------------------------------------------------------------

/// Stable handle to a timer record: the index of its arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) u8);

impl TimerId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether a timer fires once or re-arms itself at its period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once, then release the slot.
    OneShot,
    /// Re-splice into the list at the original period after each fire.
    Periodic,
}

/// Callback invoked when a timer fires, from the scheduler's execution
/// pass (never from interrupt context). Receives the kernel state, the
/// firing timer's handle and the opaque argument given at creation.
pub type TimerHandler = fn(&mut Scheduler, TimerId, usize);

// ---------------------------------------------------------------------------
// Timer records
// ---------------------------------------------------------------------------

struct TimerSlot {
    active: bool,
    /// Tick delta from the predecessor while listed; holds the absolute
    /// delay between creation and insertion.
    ticks_left: u32,
    /// The delay given at creation, kept for periodic re-arming.
    period: u32,
    kind: TimerKind,
    handler: Option<TimerHandler>,
    arg: usize,
    next: Option<TimerId>,
}

impl TimerSlot {
    const EMPTY: Self = Self {
        active: false,
        ticks_left: 0,
        period: 0,
        kind: TimerKind::OneShot,
        handler: None,
        arg: 0,
        next: None,
    };
}

/// A timer unlinked from the list by [`TimerTable::advance`], ready for
/// its callback to run.
pub(crate) struct FiredTimer {
    pub id: TimerId,
    pub handler: Option<TimerHandler>,
    pub arg: usize,
}

// ---------------------------------------------------------------------------
// Timer table
// ---------------------------------------------------------------------------

/// The timer arena plus the delta-ordered pending list.
pub struct TimerTable {
    slots: [TimerSlot; MAX_TIMERS],
    head: Option<TimerId>,
}

impl TimerTable {
    pub const fn new() -> Self {
        Self {
            slots: [TimerSlot::EMPTY; MAX_TIMERS],
            head: None,
        }
    }

    /// Allocate a timer firing `ticks` from now and splice it into the
    /// pending list. Fails with [`Error::OutOfMemory`] when the arena
    /// is exhausted; no state is retained on failure.
    pub(crate) fn create(
        &mut self,
        ticks: u32,
        handler: TimerHandler,
        arg: usize,
        kind: TimerKind,
    ) -> Result<TimerId, Error> {
        let slot = (0..MAX_TIMERS)
            .find(|&i| !self.slots[i].active)
            .ok_or(Error::OutOfMemory)?;
        let id = TimerId(slot as u8);

        self.slots[slot] = TimerSlot {
            active: true,
            ticks_left: ticks,
            period: ticks,
            kind,
            handler: Some(handler),
            arg,
            next: None,
        };
        self.insert(id);
        Ok(id)
    }

    /// Splice `id` into the delta list. On entry `ticks_left` holds the
    /// absolute delay; on exit it holds the delta from the predecessor,
    /// and the successor's delta has been reduced by the same amount so
    /// that every cumulative deadline behind the new node is unchanged.
    fn insert(&mut self, id: TimerId) {
        let mut remaining = self.slots[id.index()].ticks_left;
        let mut prev: Option<TimerId> = None;
        let mut cur = self.head;

        while let Some(c) = cur {
            if remaining < self.slots[c.index()].ticks_left {
                break;
            }
            remaining -= self.slots[c.index()].ticks_left;
            prev = Some(c);
            cur = self.slots[c.index()].next;
        }

        if let Some(c) = cur {
            self.slots[c.index()].ticks_left -= remaining;
        }
        self.slots[id.index()].ticks_left = remaining;
        self.slots[id.index()].next = cur;
        match prev {
            Some(p) => self.slots[p.index()].next = Some(id),
            None => self.head = Some(id),
        }
    }

    /// Stop and release a timer before it fires.
    ///
    /// Unlinks the timer, crediting its delta to the successor so later
    /// deadlines are unaffected. A timer that has already been unlinked
    /// for firing is only deactivated, which also cancels the re-arming
    /// of a periodic timer from inside its own callback.
    pub(crate) fn stop(&mut self, id: TimerId) {
        let mut prev: Option<TimerId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == id {
                let next = self.slots[c.index()].next;
                let delta = self.slots[c.index()].ticks_left;
                if let Some(n) = next {
                    self.slots[n.index()].ticks_left += delta;
                }
                match prev {
                    Some(p) => self.slots[p.index()].next = next,
                    None => self.head = next,
                }
                break;
            }
            prev = Some(c);
            cur = self.slots[c.index()].next;
        }
        self.slots[id.index()] = TimerSlot::EMPTY;
    }

    /// Consume up to `left` elapsed ticks from the head of the list.
    ///
    /// Returns the next expired timer, unlinked and ready to fire, or
    /// `None` once the head's delta outlasts the remaining ticks. The
    /// caller pumps this in a loop, running each callback and then
    /// calling [`TimerTable::retire`], so that chains of coincident
    /// deadlines all fire in one processing pass.
    pub(crate) fn advance(&mut self, left: &mut u32) -> Option<FiredTimer> {
        let head = self.head?;
        let delta = self.slots[head.index()].ticks_left;
        if delta > *left {
            self.slots[head.index()].ticks_left = delta - *left;
            *left = 0;
            return None;
        }

        *left -= delta;
        self.head = self.slots[head.index()].next;
        self.slots[head.index()].ticks_left = 0;
        self.slots[head.index()].next = None;
        Some(FiredTimer {
            id: head,
            handler: self.slots[head.index()].handler,
            arg: self.slots[head.index()].arg,
        })
    }

    /// Put a fired timer to rest: re-splice a periodic timer at its
    /// period, release a one-shot slot. Skips timers the callback
    /// already stopped.
    pub(crate) fn retire(&mut self, id: TimerId) {
        if !self.slots[id.index()].active {
            return;
        }
        match self.slots[id.index()].kind {
            TimerKind::Periodic => {
                self.slots[id.index()].ticks_left = self.slots[id.index()].period;
                self.insert(id);
            }
            TimerKind::OneShot => {
                self.slots[id.index()] = TimerSlot::EMPTY;
            }
        }
    }

    /// Whether a timer is still pending. Mostly useful to tests and
    /// diagnostics.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.slots[id.index()].active
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Scheduler, _: TimerId, _: usize) {}

    fn deltas(table: &TimerTable) -> std::vec::Vec<u32> {
        let mut out = std::vec::Vec::new();
        let mut cur = table.head;
        while let Some(c) = cur {
            out.push(table.slots[c.index()].ticks_left);
            cur = table.slots[c.index()].next;
        }
        out
    }

    #[test]
    fn insertion_order_is_deadline_order() {
        let mut table = TimerTable::new();
        table.create(5, noop, 0, TimerKind::OneShot).unwrap();
        table.create(3, noop, 0, TimerKind::OneShot).unwrap();
        table.create(10, noop, 0, TimerKind::OneShot).unwrap();

        // Absolute deadlines 3, 5, 10 regardless of insertion order.
        assert_eq!(deltas(&table), [3, 2, 5]);
    }

    #[test]
    fn advance_fires_in_deadline_order() {
        let mut table = TimerTable::new();
        let t5 = table.create(5, noop, 0, TimerKind::OneShot).unwrap();
        let t3 = table.create(3, noop, 0, TimerKind::OneShot).unwrap();

        let mut left = 2;
        assert!(table.advance(&mut left).is_none());

        // One more tick reaches the first deadline only.
        let mut left = 1;
        let fired = table.advance(&mut left).unwrap();
        assert_eq!(fired.id, t3);
        table.retire(t3);
        assert!(table.advance(&mut left).is_none());

        let mut left = 2;
        let fired = table.advance(&mut left).unwrap();
        assert_eq!(fired.id, t5);
        table.retire(t5);
        assert!(!table.is_pending(t5));
    }

    #[test]
    fn coincident_deadlines_fire_in_one_pass() {
        let mut table = TimerTable::new();
        let a = table.create(4, noop, 0, TimerKind::OneShot).unwrap();
        let b = table.create(4, noop, 0, TimerKind::OneShot).unwrap();
        let c = table.create(9, noop, 0, TimerKind::OneShot).unwrap();

        let mut left = 6;
        let first = table.advance(&mut left).unwrap();
        table.retire(first.id);
        let second = table.advance(&mut left).unwrap();
        table.retire(second.id);
        assert_eq!((first.id, second.id), (a, b));
        assert!(table.advance(&mut left).is_none());

        // The survivor still fires at its original absolute deadline.
        assert_eq!(deltas(&table), [3]);
        assert!(table.is_pending(c));
    }

    #[test]
    fn stop_credits_delta_to_successor() {
        let mut table = TimerTable::new();
        table.create(3, noop, 0, TimerKind::OneShot).unwrap();
        let mid = table.create(5, noop, 0, TimerKind::OneShot).unwrap();
        table.create(10, noop, 0, TimerKind::OneShot).unwrap();

        table.stop(mid);

        assert_eq!(deltas(&table), [3, 7]);
        assert!(!table.is_pending(mid));
    }

    #[test]
    fn periodic_timer_rearms_at_its_period() {
        let mut table = TimerTable::new();
        let p = table.create(4, noop, 0, TimerKind::Periodic).unwrap();

        for _ in 0..3 {
            let mut left = 4;
            let fired = table.advance(&mut left).unwrap();
            assert_eq!(fired.id, p);
            table.retire(p);
            assert!(table.is_pending(p));
            assert_eq!(deltas(&table), [4]);
        }
    }

    #[test]
    fn arena_exhaustion_reports_out_of_memory() {
        let mut table = TimerTable::new();
        for _ in 0..MAX_TIMERS {
            table.create(1, noop, 0, TimerKind::OneShot).unwrap();
        }
        assert_eq!(
            table.create(1, noop, 0, TimerKind::OneShot),
            Err(Error::OutOfMemory)
        );
    }
}
