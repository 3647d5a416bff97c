//! Kernel heap singleton.
//!
//! Wires a [`kheap::Heap`] over the virtual window reserved for the kernel
//! heap, behind an [`IntrMutex`] so that interrupt handlers can allocate
//! without racing the main flow. The page-mapping side lives with the paging
//! code; it reaches this module only as the [`MapFrames`] hook.

use core::ptr::NonNull;

use arrayvec::ArrayVec;
use kheap::{AllocError, BlockInfo, FrameProvider, Heap, HeapInitError, HeapStats};
use snafu::{Location, ResultExt as _, Snafu, ensure};

use crate::{error, memory::Align as _, sync::IntrMutex};

static KHEAP: IntrMutex<Option<Heap<BootFrameProvider>>> = IntrMutex::new(None);

/// Frame-mapping hook supplied by the paging layer.
///
/// Maps `len` bytes of physical frames at the page-aligned address `at`;
/// returns `false` when no frames are left.
pub type MapFrames = fn(at: *mut u8, len: usize) -> bool;

/// [`FrameProvider`] over the kernel's heap window.
///
/// Tracks how much of the window is backed and asks the paging layer for
/// more frames one page-multiple at a time.
pub struct BootFrameProvider {
    base: *mut u8,
    capacity: usize,
    committed: usize,
    map_frames: MapFrames,
}

unsafe impl Send for BootFrameProvider {}

impl BootFrameProvider {
    /// Describes the heap window `[base, base + capacity)`, of which the
    /// first `committed` bytes are already mapped.
    ///
    /// # Safety
    ///
    /// The window must be exclusive to the kernel heap, and `map_frames`
    /// must actually back the requested ranges.
    #[must_use]
    pub unsafe fn new(
        base: *mut u8,
        capacity: usize,
        committed: usize,
        map_frames: MapFrames,
    ) -> Self {
        Self {
            base,
            capacity,
            committed,
            map_frames,
        }
    }
}

unsafe impl FrameProvider for BootFrameProvider {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn committed(&self) -> usize {
        self.committed
    }

    fn extend(&mut self, min_bytes: usize) -> usize {
        let available = self.capacity - self.committed;
        if min_bytes > available {
            return 0;
        }
        let len = min_bytes.page_align_up().min(available);
        let at = unsafe { self.base.byte_add(self.committed) };
        if !(self.map_frames)(at, len) {
            return 0;
        }
        self.committed += len;
        len
    }
}

/// Invalid heap setup. Fatal at boot; [`init`] does not return it.
#[derive(Debug, Snafu)]
pub enum HeapSetupError {
    #[snafu(display("kernel heap initialized twice"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("kernel heap arena rejected"))]
    Arena {
        #[snafu(implicit)]
        location: Location,
        source: HeapInitError,
    },
}

/// One-time heap setup over the provider's window.
///
/// # Safety
///
/// See [`BootFrameProvider::new`]; the window must stay valid for the rest
/// of the kernel's lifetime.
pub unsafe fn try_init(provider: BootFrameProvider) -> Result<(), HeapSetupError> {
    let mut slot = KHEAP.lock();
    ensure!(slot.is_none(), AlreadyInitializedSnafu);
    let heap = unsafe { Heap::new(provider) }.context(ArenaSnafu)?;
    *slot = Some(heap);
    Ok(())
}

/// [`try_init`], with misconfiguration treated as fatal.
///
/// # Safety
///
/// See [`try_init`].
pub unsafe fn init(provider: BootFrameProvider) {
    if let Err(err) = unsafe { try_init(provider) } {
        error::report(err);
    }
}

/// Allocates `size` bytes of kernel memory.
///
/// An [`AllocError::OutOfMemory`] result is returned to the caller: most
/// call sites treat it as fatal, but a driver may back off instead.
///
/// # Panics
///
/// Panics when the heap is used before [`init`].
pub fn kalloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    let mut slot = KHEAP.lock();
    let heap = slot.as_mut().expect("kernel heap used before initialization");
    heap.allocate(size)
}

/// Frees an allocation returned by [`kalloc`].
///
/// A double free, a pointer the heap never returned, or corrupted block
/// metadata is reported as a fatal error rather than absorbed into the free
/// list.
///
/// # Safety
///
/// `ptr` must come from [`kalloc`] and must not be referenced afterwards.
///
/// # Panics
///
/// Panics when the heap is used before [`init`].
pub unsafe fn kfree(ptr: NonNull<u8>) {
    let mut slot = KHEAP.lock();
    let heap = slot.as_mut().expect("kernel heap used before initialization");
    if let Err(err) = unsafe { heap.free(ptr) } {
        drop(slot);
        error::report(err);
    }
}

/// Current free-region frontier: the address just past the mapped part of
/// the heap window. Boot logs it once.
///
/// # Panics
///
/// Panics when the heap is used before [`init`].
#[must_use]
pub fn frontier() -> usize {
    KHEAP
        .lock()
        .as_ref()
        .expect("kernel heap used before initialization")
        .frontier()
}

/// Snapshot of the heap accounting.
///
/// # Panics
///
/// Panics when the heap is used before [`init`].
#[must_use]
pub fn stats() -> HeapStats {
    KHEAP
        .lock()
        .as_ref()
        .expect("kernel heap used before initialization")
        .stats()
}

/// Logs the block map, bounded so a fragmented heap cannot flood the
/// console from inside the heap lock.
pub fn log_blocks() {
    const MAX_LINES: usize = 64;
    let mut snapshot = ArrayVec::<BlockInfo, MAX_LINES>::new();
    let truncated = {
        let slot = KHEAP.lock();
        let heap = slot.as_ref().expect("kernel heap used before initialization");
        let mut truncated = false;
        for block in heap.blocks() {
            if snapshot.try_push(block).is_err() {
                truncated = true;
                break;
            }
        }
        truncated
    };
    for block in &snapshot {
        info!(
            "  {:#010x} {:8} bytes {}",
            block.offset,
            block.size,
            if block.free { "free" } else { "used" }
        );
    }
    if truncated {
        info!("  ... block map truncated at {MAX_LINES} entries");
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use core::alloc::Layout;

    use super::*;
    use crate::memory::PAGE_SIZE;

    fn map_ok(_at: *mut u8, _len: usize) -> bool {
        true
    }

    fn map_fail(_at: *mut u8, _len: usize) -> bool {
        false
    }

    fn leak_arena(len: usize) -> *mut u8 {
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        unsafe { alloc::alloc::alloc(layout) }
    }

    #[test]
    fn provider_extends_in_page_multiples() {
        let base = leak_arena(16384);
        let mut provider = unsafe { BootFrameProvider::new(base, 16384, 4096, map_ok) };

        assert_eq!(provider.extend(100), PAGE_SIZE);
        assert_eq!(provider.committed(), 8192);

        // More than the window has left.
        assert_eq!(provider.extend(20000), 0);
        assert_eq!(provider.committed(), 8192);
    }

    #[test]
    fn provider_reports_mapping_failure() {
        let base = leak_arena(16384);
        let mut provider = unsafe { BootFrameProvider::new(base, 16384, 4096, map_fail) };

        assert_eq!(provider.extend(100), 0);
        assert_eq!(provider.committed(), 4096);
    }
}
