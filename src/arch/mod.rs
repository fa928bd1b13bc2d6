//! # Architecture Abstraction Layer
//!
//! Provides a hardware abstraction boundary for the scheduler. The
//! Cortex-M4 port carries the real context-switch machinery; on any
//! other target a stub port stands in so the kernel logic itself can
//! run under `cargo test` on the host.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::trigger_context_switch;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::trigger_context_switch;
