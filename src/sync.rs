//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstraction. All shared kernel state
//! must be accessed within a critical section to prevent data races
//! between thread code and interrupt handlers.
//!
//! The implementation is supplied by the `critical-section` crate: on the
//! Cortex-M4 target the `cortex-m` crate's single-core provider disables
//! and restores PRIMASK; host unit tests use the `std` provider.

use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// This is the primary mechanism for safely accessing shared mutable
/// state in the kernel. The previous interrupt-enable state is restored
/// on exit, not unconditionally re-enabled, so nested use is safe, and
/// the closure shape guarantees release on every exit path.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// # Performance
/// Keep critical sections as short as possible to minimize interrupt
/// latency. The Cortex-M4's interrupt tail-chaining makes short critical
/// sections relatively inexpensive.
#[inline]
pub fn critical_section<R>(f: impl FnOnce(CriticalSection) -> R) -> R {
    critical_section::with(f)
}
