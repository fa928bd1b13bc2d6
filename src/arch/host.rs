//! # Host Stub Port
//!
//! Stand-in for the Cortex-M4 port on non-embedded targets. Context
//! switches cannot be performed on the host; unit tests observe
//! scheduling decisions through `Scheduler::switch_to_head` instead.

/// Request a context switch: no-op on the host.
#[inline]
pub fn trigger_context_switch() {}
