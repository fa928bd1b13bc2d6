//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! context switching via PendSV, SysTick timer configuration, and
//! interrupt management.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry the hardware automatically stacks R0-R3, R12, LR,
//! PC and xPSR onto the process stack. The PendSV handler manually saves
//! and restores R4-R11, which completes the full context save/restore.
//!
//! The scheduler requests a switch by pending PendSV; the exception is
//! taken as soon as the requesting critical section ends, which is what
//! lets a blocking `event_wait` finish its bookkeeping before the
//! calling thread is actually suspended.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF), so the
//! context switch never preempts another ISR and the tick never
//! interferes with higher-priority interrupts. The SysTick handler only
//! increments the tick counter; timers are processed by the scheduler
//! pass, keeping suspension points explicit.

use core::arch::{asm, naked_asm};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m_rt::exception;

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::KERNEL_PTR;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer for the system tick.
///
/// Sets up SysTick to fire at `TICK_HZ` using the processor clock. Each
/// tick advances the kernel's monotonic counter via `SysTick_Handler`.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// Context switch request
// ---------------------------------------------------------------------------

/// Request a context switch by pending the PendSV exception.
///
/// PendSV is the standard Cortex-M mechanism for deferred context
/// switching. It fires at the lowest priority, so it only runs when no
/// other ISR is active, and not before the requesting critical section
/// has ended.
///
/// Sets the PENDSVSET bit in the Interrupt Control and State Register.
#[inline]
pub fn trigger_context_switch() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First thread launch
// ---------------------------------------------------------------------------

/// Start the first thread by switching to PSP and branching to Thread
/// mode. Called once during `kernel::start()`; never returns.
///
/// # Safety
/// Must only be called once, with a stack pointer prepared by the
/// scheduler's stack initialization.
pub unsafe fn start_first_thread(psp: *mut u32) -> ! {
    asm!(
        // Set PSP to the thread's stack pointer (skip SW-saved R4-R11)
        "adds r0, #32",        // Skip 8 SW registers (8 x 4 = 32 bytes)
        "msr psp, r0",         // Set process stack pointer

        // Switch to PSP for Thread mode (set CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Pop the hardware frame manually since we are not actually
        // returning from an exception
        "pop {{r0-r3, r12}}",  // R0-R3, R12
        "pop {{r4}}",          // LR (discarded, thread entries never return)
        "pop {{r5}}",          // PC (thread entry point)
        "pop {{r6}}",          // xPSR (discarded)

        // Branch to the thread
        "cpsie i",             // Enable interrupts
        "bx r5",               // Jump to the entry point

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// ## Sequence
/// 1. Save R4-R11 onto the current thread's stack (PSP)
/// 2. Store the updated PSP into the current thread's record
/// 3. Promote the run-queue head to current
/// 4. Load the next thread's PSP from its record
/// 5. Restore R4-R11 from the new thread's stack
/// 6. Return from exception (hardware restores R0-R3, R12, LR, PC, xPSR)
///
/// # Safety
/// This is a naked function called directly by the NVIC. It must follow
/// the exact Cortex-M4 exception entry/exit convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        // --- Save current context ---
        "mrs r0, psp",             // Get current PSP
        "stmdb r0!, {{r4-r11}}",   // Push R4-R11 onto the thread stack

        "bl {store_context}",      // store_context(r0: *mut u32)

        // --- Select next thread ---
        "bl {resolve_context}",    // Returns new PSP in r0

        // --- Restore new context ---
        "ldmia r0!, {{r4-r11}}",   // Pop R4-R11 from the new thread stack
        "msr psp, r0",             // Set PSP to the new thread's stack

        // Return from exception using PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",

        store_context = sym store_context,
        resolve_context = sym resolve_context,
    );
}

/// Save the outgoing thread's stack pointer. Called from PendSV.
///
/// # Safety
/// Called from exception context with a valid PSP.
unsafe extern "C" fn store_context(psp: *mut u32) {
    (*KERNEL_PTR).store_stack_pointer(psp);
}

/// Promote the run-queue head and return its stack pointer. Called from
/// PendSV.
///
/// # Safety
/// Called from exception context after `store_context`.
unsafe extern "C" fn resolve_context() -> *mut u32 {
    (*KERNEL_PTR).switch_to_head()
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler.
///
/// Only advances the kernel's monotonic tick counter. Timer processing
/// and any resulting context switches happen inside the scheduler pass,
/// so threads are never suspended at an implicit point.
#[exception]
fn SysTick() {
    unsafe { (*KERNEL_PTR).tick() };
}
