//! # Kestrel Configuration
//!
//! Compile-time constants governing kernel capacity and timing.
//! All limits are fixed at compile time - no dynamic allocation.

/// Maximum number of threads the kernel can manage simultaneously,
/// including the reserved idle thread. Bounds the static thread arena.
/// Increase with care - each slot carries `STACK_SIZE` bytes of RAM.
pub const MAX_THREADS: usize = 8;

/// Maximum number of wait-queue head cells, including the two reserved
/// cells (run queue and the internal sleep queue). Drivers and other
/// event sources allocate theirs from the remainder via `queue_create`.
pub const MAX_WAIT_QUEUES: usize = 8;

/// Maximum number of virtual timers alive at any one time. Timed waits
/// consume one slot each for the duration of the wait.
pub const MAX_TIMERS: usize = 8;

/// Per-thread stack size in bytes. Must be large enough for the deepest
/// call chain plus the hardware exception frame (32 bytes) and the
/// software-saved context (32 bytes for R4-R11).
pub const STACK_SIZE: usize = 1024;

/// SysTick frequency in Hz. Determines the granularity of virtual
/// timers and timed waits.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Priority of the reserved idle thread. The highest numeric value is
/// the least important priority, so the idle thread only runs when
/// nothing else is ready.
pub const IDLE_PRIORITY: u8 = 255;

/// Default priority assigned to the main thread created by the idle
/// thread on first dispatch. Lower numeric values are more important.
pub const DEFAULT_PRIORITY: u8 = 64;

/// Timeout value meaning "wait forever" when passed to `event_wait`.
pub const WAIT_INFINITE: u32 = 0;
