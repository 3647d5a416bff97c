//! Kernel boot sequence.
//!
//! The architecture stub (out of tree: entry assembly, descriptor tables,
//! paging setup) installs a console sink, reserves the heap window, and
//! jumps here. [`kernel_main`] brings up the heap, switches interrupts on,
//! and runs the allocator demo that the boot console shows on every start:
//! a handful of irregular allocations chosen so that splitting and every
//! coalescing case are visible in the logged block counts.

use core::ptr::{self, NonNull};

use crate::{
    error, interrupt,
    memory::{Align as _, heap},
};

/// Hand-off from the boot environment.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Start of the virtual window reserved for the kernel heap.
    pub heap_base: *mut u8,
    /// Size of the window; the heap never grows past it.
    pub heap_capacity: usize,
    /// Bytes of the window already backed by frames at hand-off.
    pub heap_committed: usize,
    /// Paging hook that backs more of the window.
    pub map_frames: heap::MapFrames,
}

/// Kernel entry point proper, called once by the boot stub.
pub fn kernel_main(config: BootConfig) {
    assert!(config.heap_committed.is_page_aligned());

    init_message("initializing kernel heap memory allocator");
    let provider = unsafe {
        heap::BootFrameProvider::new(
            config.heap_base,
            config.heap_capacity,
            config.heap_committed,
            config.map_frames,
        )
    };
    unsafe {
        heap::init(provider);
    }
    init_message_ok();
    info!(
        "reserving memory for the kernel heap: {:3}KiB",
        config.heap_capacity / 1024
    );
    info!("kernel free heap starts at {:#x}", heap::frontier());

    // Devices are ready; the CPU starts taking interrupts.
    interrupt::enable();

    heap_demo();

    info!("final kernel heap block map:");
    heap::log_blocks();
}

fn init_message(msg: &str) {
    print!("[\x1B[34;1mINIT\x1B[0m] {msg}...");
}

fn init_message_ok() {
    println!(" \x1B[32;1mOK\x1B[0m");
}

/// Allocates and frees a few irregular sizes to show splitting and
/// coalescing on the boot console.
fn heap_demo() {
    println!();
    println!("kallocing arr1 - 128 bytes...");
    let arr1 = must_alloc(128);
    write_greeting(arr1, 128);
    log_free_space();

    println!("kallocing arr2 - 23 bytes...");
    let arr2 = must_alloc(23);
    write_greeting(arr2, 23);
    log_free_space();

    println!("kallocing arr3 - 437 bytes...");
    let arr3 = must_alloc(437);
    write_greeting(arr3, 437);
    log_free_space();

    println!("kfreeing arr3, should coalesce with the big chunk...");
    unsafe {
        heap::kfree(arr3);
    }
    log_free_space();

    println!("kfreeing arr1, should have no coalescing...");
    unsafe {
        heap::kfree(arr1);
    }
    log_free_space();

    println!("kallocing arr4 - 54 bytes, should reuse the first chunk...");
    let arr4 = must_alloc(54);
    write_greeting(arr4, 54);
    log_free_space();

    println!("kfreeing arr2, should coalesce with both neighbors...");
    unsafe {
        heap::kfree(arr2);
    }
    log_free_space();

    println!("kallocing arr5 - 3971 bytes...");
    let arr5 = must_alloc(3971);
    write_greeting(arr5, 3971);
    log_free_space();
}

/// Boot-time allocations are load-bearing; failure here is fatal.
fn must_alloc(size: usize) -> NonNull<u8> {
    match heap::kalloc(size) {
        Ok(ptr) => ptr,
        Err(err) => error::report(err),
    }
}

/// Touches the fresh allocation so the demo proves the memory is writable.
fn write_greeting(dst: NonNull<u8>, len: usize) {
    let msg = b"hello\n";
    let n = msg.len().min(len);
    unsafe {
        ptr::copy_nonoverlapping(msg.as_ptr(), dst.as_ptr(), n);
    }
}

fn log_free_space() {
    let stats = heap::stats();
    info!(
        "heap now: {} free block(s), {} bytes free",
        stats.free_blocks, stats.free_bytes
    );
}
