//! Ochre kernel runtime.
//!
//! A small monolithic kernel built around its heap allocator. The modules
//! here are the pieces the allocator needs to live in a kernel: a console
//! boundary for boot output, leveled logging, scoped interrupt control, an
//! interrupt-masking lock for single-core state, and the memory subsystem
//! wiring the [`kheap`] arena into a process-wide singleton.
//!
//! The architecture entry stub, descriptor tables, paging, and device
//! drivers live outside this crate; they hand [`boot::kernel_main`] a
//! console sink and the heap's virtual window.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
pub mod console;
#[macro_use]
pub mod log;

pub mod boot;
pub mod error;
pub mod interrupt;
pub mod memory;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support {
    /// Serializes tests that touch process-wide kernel state (the emulated
    /// interrupt flag, the console sink, the heap singleton).
    pub(crate) static GATE: spin::Mutex<()> = spin::Mutex::new(());
}
