//! Boundary-tag heap allocator for the Ochre kernel.
//!
//! This crate implements the kernel's general-purpose heap: a freestanding
//! `malloc`/`free` that manages a fixed virtual address range with all of its
//! metadata stored in-band, inside the memory it hands out. It is `no_std`
//! and has no allocator of its own to fall back on.
//!
//! # Algorithm
//!
//! The allocator combines a **first-fit** scan over an **address-ordered
//! free list** with **eager boundary-tag coalescing**:
//!
//! - Every block, allocated or free, starts and ends with a boundary tag
//!   recording its size and state. The trailing copy lets the block's
//!   physical predecessor be found by pure address arithmetic, without a
//!   stored back-pointer.
//! - Free blocks additionally carry doubly-linked free-list links in their
//!   payload area, kept sorted by address.
//! - Allocation scans the free list for the first block large enough and
//!   splits off the remainder when it is still a viable block.
//! - Deallocation merges the freed block with both physical neighbors
//!   immediately, so no two adjacent blocks are ever both free.
//!
//! # Memory layout
//!
//! ```text
//! Block layout (sizes in bytes, total size is a multiple of 16):
//! ┌────────────────┬──────────────────────────────┬────────────────┐
//! │ header tag (16)│ payload                      │ footer tag (16)│
//! │ size │ state   │ (free blocks: prev/next here)│ size │ state   │
//! └────────────────┴──────────────────────────────┴────────────────┘
//! ```
//!
//! The state word doubles as a corruption sentinel: freeing a pointer whose
//! recovered header does not carry one of the two known tag patterns is
//! reported as an error instead of silently poisoning the free list.
//!
//! # Arena growth
//!
//! The backing region is supplied by a [`FrameProvider`]. The arena's
//! capacity is fixed, but it may be backed by physical frames incrementally:
//! when no free block satisfies a request the allocator asks the provider to
//! extend the committed region, up to the capacity ceiling. Nothing is ever
//! handed back to the provider.
//!
//! # Usage
//!
//! ```rust
//! use kheap::{FixedRegion, Heap};
//!
//! let mut backing = vec![0u8; 4096];
//! let region = unsafe { FixedRegion::new(backing.as_mut_ptr(), backing.len()) };
//! let mut heap = unsafe { Heap::new(region) }.unwrap();
//!
//! let ptr = heap.allocate(64).unwrap();
//! // ... use the memory ...
//! unsafe { heap.free(ptr) }.unwrap();
//! ```
//!
//! # Concurrency
//!
//! A [`Heap`] is a plain value: `Send` but not `Sync`. The kernel wraps its
//! singleton instance in an interrupt-disabling mutex; this crate contains no
//! locking of its own, which keeps it testable with independent instances.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod heap;

pub use self::heap::{
    AllocError, BlockInfo, Blocks, CheckError, FixedRegion, FrameProvider, FreeError, Heap,
    HeapInitError, HeapStats, MIN_ALLOC_ALIGN,
};
