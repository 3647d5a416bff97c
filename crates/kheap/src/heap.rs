//! Free-list heap over a provider-backed arena.

use core::ptr::{self, NonNull};

use snafu::{Location, Snafu, ensure};

use crate::block::{
    ALIGN, BoundaryTag, FreeLinks, MIN_BLOCK_SIZE, OVERHEAD, TAG_FREE, TAG_SIZE, TAG_USED,
};

/// Alignment guaranteed for every pointer returned by [`Heap::allocate`].
pub const MIN_ALLOC_ALIGN: usize = ALIGN;

/// Source of backing memory for a [`Heap`].
///
/// The provider owns the arena's address range and the mapping of physical
/// frames behind it. The heap treats the range as a one-way ratchet: the
/// committed prefix may only grow, up to [`capacity`](Self::capacity), and
/// nothing is ever returned.
///
/// # Safety
///
/// Implementors must guarantee that `[base, base + committed)` is valid,
/// writable memory exclusive to the heap for the heap's whole lifetime, and
/// that every successful [`extend`](Self::extend) enlarges that region by
/// exactly the returned number of bytes.
pub unsafe trait FrameProvider {
    /// Start address of the arena. Must be aligned to [`MIN_ALLOC_ALIGN`].
    fn base(&self) -> *mut u8;

    /// Hard ceiling on the arena size in bytes. Fixed for the provider's
    /// lifetime.
    fn capacity(&self) -> usize;

    /// Bytes backed by frames at initialization time.
    fn committed(&self) -> usize;

    /// Backs at least `min_bytes` more of the arena.
    ///
    /// Returns the number of bytes newly backed (a frame-granular amount
    /// that may exceed the request), or 0 when the request cannot be
    /// satisfied in full, either because the capacity ceiling is reached or
    /// because no frames are left.
    fn extend(&mut self, min_bytes: usize) -> usize;
}

/// A fixed, fully-backed arena: the whole capacity is committed up front and
/// [`extend`](FrameProvider::extend) always fails.
///
/// The given region is trimmed to tag alignment, mirroring what the kernel's
/// paging layer hands over.
pub struct FixedRegion {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for FixedRegion {}

impl FixedRegion {
    /// Wraps the region `[base, base + len)`, aligning the start and length
    /// down to the heap's granularity.
    ///
    /// # Safety
    ///
    /// The region must be valid, writable memory, exclusive to the returned
    /// provider (and the heap built on it) for as long as either lives.
    #[must_use]
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        let offset = base.align_offset(ALIGN).min(len);
        let base = unsafe { base.byte_add(offset) };
        let len = (len - offset) / ALIGN * ALIGN;
        Self { base, len }
    }
}

unsafe impl FrameProvider for FixedRegion {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn capacity(&self) -> usize {
        self.len
    }

    fn committed(&self) -> usize {
        self.len
    }

    fn extend(&mut self, _min_bytes: usize) -> usize {
        0
    }
}

/// Error establishing the arena. Callers treat this as fatal misconfiguration.
#[derive(Debug, Snafu)]
pub enum HeapInitError {
    #[snafu(display("arena base {base:#x} is not aligned to {align} bytes"))]
    MisalignedBase {
        base: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "arena capacity {capacity:#x} cannot hold a single block (minimum {min:#x} bytes)"
    ))]
    CapacityTooSmall {
        capacity: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "initially committed region {committed:#x} cannot hold a single block \
         (minimum {min:#x} bytes)"
    ))]
    CommittedTooSmall {
        committed: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("committed region {committed:#x} exceeds arena capacity {capacity:#x}"))]
    CommittedOutOfBounds {
        committed: usize,
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Allocation failure. Returned to the caller, never masked.
#[derive(Debug, Snafu)]
pub enum AllocError {
    #[snafu(display("out of memory: no free block can hold {requested} bytes"))]
    OutOfMemory {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Verdict of the deallocation guards.
///
/// None of these are recoverable at the heap level: the metadata (or the
/// caller) is wrong, and continuing to operate on the free list would
/// compound the damage. The kernel halts on any of them.
#[derive(Debug, Snafu)]
pub enum FreeError {
    #[snafu(display("pointer {addr:#x} was not returned by this heap"))]
    ForeignPointer {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("double free of pointer {addr:#x}"))]
    DoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("corrupted block metadata at {addr:#x}: {what}"))]
    CorruptedMetadata {
        addr: usize,
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Invariant violation found by [`Heap::check`].
#[derive(Debug, Snafu)]
pub enum CheckError {
    #[snafu(display("bad block at offset {offset:#x}: {what}"))]
    BadBlock {
        offset: usize,
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("adjacent free blocks at offset {offset:#x}"))]
    AdjacentFreeBlocks {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list does not match the arena: {what}"))]
    FreeListMismatch {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Point-in-time accounting of the arena, gathered by a full block walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub committed: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

/// One block as seen by the [`Heap::blocks`] walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block header from the arena base.
    pub offset: usize,
    /// Total block size, metadata included.
    pub size: usize,
    pub free: bool,
}

/// First-fit boundary-tag heap.
///
/// Blocks tile the committed prefix of the arena exactly; free blocks are
/// chained in an address-ordered doubly-linked list threaded through their
/// payload bytes. Coalescing is eager: after every [`free`](Self::free) no
/// two adjacent blocks are both free.
///
/// A `Heap` is `Send` but not `Sync`; the kernel serializes access behind an
/// interrupt-disabling lock.
pub struct Heap<P> {
    provider: P,
    base: *mut u8,
    capacity: usize,
    committed: usize,
    free_head: *mut BoundaryTag,
}

unsafe impl<P> Send for Heap<P> where P: Send {}

impl<P> core::fmt::Debug for Heap<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("committed", &self.committed)
            .field("free_head", &self.free_head)
            .finish_non_exhaustive()
    }
}

impl<P> Heap<P> {
    /// Pointer to the boundary tag `offset` bytes into the arena.
    ///
    /// `offset` must be tag-aligned and at most one region past the
    /// committed frontier; every caller derives it from block metadata that
    /// satisfies this.
    fn header_at(&self, offset: usize) -> *mut BoundaryTag {
        #[expect(clippy::cast_ptr_alignment)]
        let header = unsafe { self.base.byte_add(offset) }.cast::<BoundaryTag>();
        header
    }
}

impl<P> Heap<P>
where
    P: FrameProvider,
{
    /// Establishes the arena as a single free block spanning the committed
    /// region.
    ///
    /// # Safety
    ///
    /// The provider's region must be valid per the [`FrameProvider`]
    /// contract, and no other heap may be built over the same region.
    pub unsafe fn new(provider: P) -> Result<Self, HeapInitError> {
        let base = provider.base();
        let capacity = provider.capacity() / ALIGN * ALIGN;
        let committed = provider.committed() / ALIGN * ALIGN;

        ensure!(
            base.addr().is_multiple_of(ALIGN),
            MisalignedBaseSnafu {
                base: base.addr(),
                align: ALIGN,
            }
        );
        ensure!(
            capacity >= MIN_BLOCK_SIZE,
            CapacityTooSmallSnafu {
                capacity,
                min: MIN_BLOCK_SIZE,
            }
        );
        ensure!(
            committed >= MIN_BLOCK_SIZE,
            CommittedTooSmallSnafu {
                committed,
                min: MIN_BLOCK_SIZE,
            }
        );
        ensure!(
            committed <= capacity,
            CommittedOutOfBoundsSnafu {
                committed,
                capacity,
            }
        );

        let mut heap = Self {
            provider,
            base,
            capacity,
            committed,
            free_head: ptr::null_mut(),
        };
        unsafe {
            let first = heap.header_at(0);
            BoundaryTag::write(first, committed, TAG_FREE);
            *BoundaryTag::links(first) = FreeLinks {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            };
            heap.free_head = first;
        }
        Ok(heap)
    }

    /// Allocates `size` bytes, returning a pointer aligned to
    /// [`MIN_ALLOC_ALIGN`].
    ///
    /// Scans the free list first-fit, splitting the found block when the
    /// leftover is still a viable block. When nothing fits, the arena is
    /// grown through the provider before giving up with
    /// [`AllocError::OutOfMemory`].
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        assert!(size > 0, "allocation size must be nonzero");
        let Some(footprint) = Self::footprint(size) else {
            return OutOfMemorySnafu { requested: size }.fail();
        };
        loop {
            if let Some(block) = self.find_fit(footprint) {
                let payload = unsafe { self.carve(block, footprint) };
                return Ok(payload);
            }
            self.grow(footprint, size)?;
        }
    }

    /// Releases the allocation at `ptr` and eagerly coalesces it with both
    /// physical neighbors.
    ///
    /// The header recovered from `ptr` is sanity-checked before any list
    /// surgery: a pointer the heap never returned, a repeated free, or
    /// overwritten metadata is reported instead of being absorbed.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap, and
    /// the allocation must no longer be referenced. (Violations are detected
    /// on a best-effort basis and reported as errors.)
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let addr = ptr.as_ptr().addr();
        let base = self.base.addr();
        let aligned = addr.is_multiple_of(ALIGN);
        ensure!(
            aligned && addr >= base + TAG_SIZE && addr < base + self.committed,
            ForeignPointerSnafu { addr }
        );

        unsafe {
            let block = BoundaryTag::from_payload(ptr.as_ptr());
            match (*block).tag {
                TAG_USED => {}
                TAG_FREE => return DoubleFreeSnafu { addr }.fail(),
                _ => return ForeignPointerSnafu { addr }.fail(),
            }
            self.validate(block)?;

            let mut start = block;
            let mut size = (*block).size;

            // Absorb the following block if it is free.
            let right = BoundaryTag::next_physical(block);
            if right.addr() < base + self.committed {
                ensure!(
                    (*right).tag == TAG_FREE || (*right).tag == TAG_USED,
                    CorruptedMetadataSnafu {
                        addr: right.addr(),
                        what: "invalid state tag on following block",
                    }
                );
                self.validate(right)?;
                if BoundaryTag::is_free(right) {
                    self.unlink(right);
                    size += (*right).size;
                }
            }

            // Merge into the preceding block if it is free; it becomes the
            // surviving identity.
            if block.addr() > base {
                let footer = BoundaryTag::prev_footer(block);
                match (*footer).tag {
                    TAG_USED => {}
                    TAG_FREE => {
                        let left_size = (*footer).size;
                        ensure!(
                            left_size >= MIN_BLOCK_SIZE
                                && left_size.is_multiple_of(ALIGN)
                                && left_size <= block.addr() - base,
                            CorruptedMetadataSnafu {
                                addr: footer.addr(),
                                what: "preceding boundary tag size out of bounds",
                            }
                        );
                        let left = block.byte_sub(left_size);
                        ensure!(
                            (*left).size == left_size && (*left).tag == TAG_FREE,
                            CorruptedMetadataSnafu {
                                addr: left.addr(),
                                what: "preceding block boundary tags disagree",
                            }
                        );
                        self.unlink(left);
                        start = left;
                        size += left_size;
                    }
                    _ => {
                        return CorruptedMetadataSnafu {
                            addr: footer.addr(),
                            what: "invalid state tag on preceding block",
                        }
                        .fail();
                    }
                }
            }

            BoundaryTag::write(start, size, TAG_FREE);
            self.insert_sorted(start);
        }
        Ok(())
    }

    /// Address just past the committed region. Grows as frames are mapped;
    /// boot logs it once as the initial free-heap frontier.
    #[must_use]
    pub fn frontier(&self) -> usize {
        self.base.addr() + self.committed
    }

    /// Hard ceiling on the arena size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of the arena currently backed and tiled into blocks.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Walks the committed region in physical order.
    ///
    /// The walker trusts the block metadata and stops early on an
    /// implausible size; run [`check`](Self::check) first when in doubt.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, P> {
        Blocks {
            heap: self,
            offset: 0,
        }
    }

    /// Gathers [`HeapStats`] with a full block walk.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            capacity: self.capacity,
            committed: self.committed,
            blocks: 0,
            free_blocks: 0,
            free_bytes: 0,
            largest_free: 0,
        };
        for block in self.blocks() {
            stats.blocks += 1;
            if block.free {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            }
        }
        stats
    }

    /// Verifies every structural invariant of the arena.
    ///
    /// Checks that blocks tile the committed region exactly with agreeing
    /// boundary tags, that no two adjacent blocks are free, and that the
    /// free list holds exactly the free blocks in address order. O(n); meant
    /// for tests and boot-time diagnostics, not the allocation path.
    pub fn check(&self) -> Result<(), CheckError> {
        let mut offset = 0;
        let mut prev_free = false;
        let mut free_blocks = 0;
        while offset < self.committed {
            unsafe {
                let block = self.header_at(offset);
                let size = (*block).size;
                let free = match (*block).tag {
                    TAG_FREE => true,
                    TAG_USED => false,
                    _ => {
                        return BadBlockSnafu {
                            offset,
                            what: "invalid state tag",
                        }
                        .fail();
                    }
                };
                ensure!(
                    size >= MIN_BLOCK_SIZE
                        && size.is_multiple_of(ALIGN)
                        && size <= self.committed - offset,
                    BadBlockSnafu {
                        offset,
                        what: "size out of bounds",
                    }
                );
                let footer = BoundaryTag::footer(block);
                ensure!(
                    (*footer).size == size && (*footer).tag == (*block).tag,
                    BadBlockSnafu {
                        offset,
                        what: "boundary tags disagree",
                    }
                );
                ensure!(!(free && prev_free), AdjacentFreeBlocksSnafu { offset });
                prev_free = free;
                if free {
                    free_blocks += 1;
                }
                offset += size;
            }
        }

        let mut listed = 0;
        let mut prev = ptr::null_mut::<BoundaryTag>();
        let mut cur = self.free_head;
        while !cur.is_null() {
            unsafe {
                let in_arena = cur.addr() >= self.base.addr()
                    && cur.addr() < self.base.addr() + self.committed;
                ensure!(
                    in_arena && BoundaryTag::is_free(cur),
                    FreeListMismatchSnafu {
                        what: "list entry is not a free block of this arena",
                    }
                );
                ensure!(
                    (*BoundaryTag::links(cur)).prev == prev,
                    FreeListMismatchSnafu {
                        what: "broken back link",
                    }
                );
                ensure!(
                    prev.is_null() || prev < cur,
                    FreeListMismatchSnafu {
                        what: "list out of address order",
                    }
                );
                listed += 1;
                ensure!(
                    listed <= free_blocks,
                    FreeListMismatchSnafu {
                        what: "list longer than the number of free blocks",
                    }
                );
                prev = cur;
                cur = (*BoundaryTag::links(cur)).next;
            }
        }
        ensure!(
            listed == free_blocks,
            FreeListMismatchSnafu {
                what: "free blocks missing from the list",
            }
        );
        Ok(())
    }

    /// Total footprint for a request: payload rounded up to the alignment
    /// unit, plus both boundary tags. `None` on arithmetic overflow.
    fn footprint(size: usize) -> Option<usize> {
        size.checked_next_multiple_of(ALIGN)?.checked_add(OVERHEAD)
    }

    /// First free block (in address order) with room for `footprint`.
    fn find_fit(&self, footprint: usize) -> Option<*mut BoundaryTag> {
        let mut cur = self.free_head;
        while !cur.is_null() {
            unsafe {
                if (*cur).size >= footprint {
                    return Some(cur);
                }
                cur = (*BoundaryTag::links(cur)).next;
            }
        }
        None
    }

    /// Turns the front of the free block `block` into an allocation of
    /// `footprint` bytes, splitting when the leftover is still viable.
    ///
    /// # Safety
    ///
    /// `block` must be a linked free block with `size >= footprint`.
    unsafe fn carve(&mut self, block: *mut BoundaryTag, footprint: usize) -> NonNull<u8> {
        unsafe {
            let total = (*block).size;
            let FreeLinks { prev, next } = *BoundaryTag::links(block);
            let leftover = total - footprint;
            if leftover >= MIN_BLOCK_SIZE {
                // The remainder inherits the carved block's list position,
                // which keeps the list address-ordered without a rescan.
                BoundaryTag::write(block, footprint, TAG_USED);
                let rest = BoundaryTag::next_physical(block);
                BoundaryTag::write(rest, leftover, TAG_FREE);
                *BoundaryTag::links(rest) = FreeLinks { prev, next };
                if prev.is_null() {
                    self.free_head = rest;
                } else {
                    (*BoundaryTag::links(prev)).next = rest;
                }
                if !next.is_null() {
                    (*BoundaryTag::links(next)).prev = rest;
                }
            } else {
                // Too small to stand alone; hand out the whole block.
                BoundaryTag::write(block, total, TAG_USED);
                self.unlink(block);
            }
            NonNull::new_unchecked(BoundaryTag::payload(block))
        }
    }

    /// Removes a block from the free list.
    ///
    /// # Safety
    ///
    /// `block` must be a free block currently linked into the list.
    unsafe fn unlink(&mut self, block: *mut BoundaryTag) {
        unsafe {
            let FreeLinks { prev, next } = *BoundaryTag::links(block);
            if prev.is_null() {
                self.free_head = next;
            } else {
                (*BoundaryTag::links(prev)).next = next;
            }
            if !next.is_null() {
                (*BoundaryTag::links(next)).prev = prev;
            }
        }
    }

    /// Inserts a free block at its address-ordered list position.
    ///
    /// # Safety
    ///
    /// `block` must carry valid free tags and not be linked already.
    unsafe fn insert_sorted(&mut self, block: *mut BoundaryTag) {
        unsafe {
            if self.free_head.is_null() || block < self.free_head {
                *BoundaryTag::links(block) = FreeLinks {
                    prev: ptr::null_mut(),
                    next: self.free_head,
                };
                if !self.free_head.is_null() {
                    (*BoundaryTag::links(self.free_head)).prev = block;
                }
                self.free_head = block;
                return;
            }
            let mut cur = self.free_head;
            loop {
                let next = (*BoundaryTag::links(cur)).next;
                if next.is_null() || block < next {
                    break;
                }
                cur = next;
            }
            let next = (*BoundaryTag::links(cur)).next;
            *BoundaryTag::links(block) = FreeLinks { prev: cur, next };
            (*BoundaryTag::links(cur)).next = block;
            if !next.is_null() {
                (*BoundaryTag::links(next)).prev = block;
            }
        }
    }

    /// O(1) sanity checks on one block's boundary tags.
    ///
    /// # Safety
    ///
    /// `block` must point into the committed region with at least one tag
    /// width of headroom.
    unsafe fn validate(&self, block: *mut BoundaryTag) -> Result<(), FreeError> {
        unsafe {
            let addr = block.addr();
            let size = (*block).size;
            let end = self.base.addr() + self.committed;
            ensure!(
                size >= MIN_BLOCK_SIZE && size.is_multiple_of(ALIGN) && size <= end - addr,
                CorruptedMetadataSnafu {
                    addr,
                    what: "block size out of bounds",
                }
            );
            let footer = BoundaryTag::footer(block);
            ensure!(
                (*footer).size == size && (*footer).tag == (*block).tag,
                CorruptedMetadataSnafu {
                    addr,
                    what: "boundary tags disagree",
                }
            );
        }
        Ok(())
    }

    /// Size of the free block ending exactly at the committed frontier, or 0.
    ///
    /// Found through its footer, without a list walk.
    fn trailing_free(&self) -> usize {
        let footer = self.header_at(self.committed - TAG_SIZE);
        unsafe {
            if (*footer).tag == TAG_FREE {
                (*footer).size
            } else {
                0
            }
        }
    }

    /// Asks the provider to back more of the arena so that a block of
    /// `footprint` bytes can be carved, crediting a free block already
    /// sitting at the frontier.
    fn grow(&mut self, footprint: usize, requested: usize) -> Result<(), AllocError> {
        let room = self.capacity - self.committed;
        let shortfall = footprint.saturating_sub(self.trailing_free());
        ensure!(
            shortfall > 0 && shortfall <= room,
            OutOfMemorySnafu { requested }
        );

        let got = self.provider.extend(shortfall);
        ensure!(got > 0, OutOfMemorySnafu { requested });
        debug_assert!(got.is_multiple_of(ALIGN));
        let got = got.min(room) / ALIGN * ALIGN;
        ensure!(got > 0, OutOfMemorySnafu { requested });

        unsafe {
            self.append_region(got);
        }
        Ok(())
    }

    /// Tiles `got` newly committed bytes into the arena as free space,
    /// merging with a free block already at the frontier.
    ///
    /// # Safety
    ///
    /// The provider must have just backed `got` more bytes past the current
    /// frontier.
    unsafe fn append_region(&mut self, got: usize) {
        unsafe {
            let trailing = self.trailing_free();
            let (start, size) = if trailing > 0 {
                let left = self.header_at(self.committed - trailing);
                self.unlink(left);
                (left, trailing + got)
            } else {
                (self.header_at(self.committed), got)
            };
            self.committed += got;
            BoundaryTag::write(start, size, TAG_FREE);
            self.insert_sorted(start);
        }
    }
}

/// Physical-order block walker, see [`Heap::blocks`].
pub struct Blocks<'a, P> {
    heap: &'a Heap<P>,
    offset: usize,
}

impl<P> Iterator for Blocks<'_, P> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.heap.committed {
            return None;
        }
        unsafe {
            let block = self.heap.header_at(self.offset);
            let size = (*block).size;
            if size < MIN_BLOCK_SIZE || !size.is_multiple_of(ALIGN) {
                // Corrupt size; stop rather than loop forever.
                self.offset = self.heap.committed;
                return None;
            }
            let info = BlockInfo {
                offset: self.offset,
                size,
                free: BoundaryTag::is_free(block),
            };
            self.offset += size;
            Some(info)
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::alloc::Layout;

    use super::*;

    /// Backs an arena out of a host allocation, committing frame-sized
    /// slices on demand.
    struct TestProvider {
        base: *mut u8,
        capacity: usize,
        committed: usize,
        frame: usize,
    }

    unsafe impl FrameProvider for TestProvider {
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
            let Some(need) = min_bytes.checked_next_multiple_of(self.frame) else {
                return 0;
            };
            if need > self.capacity - self.committed {
                return 0;
            }
            self.committed += need;
            need
        }
    }

    fn with_arena<F>(capacity: usize, test_fn: F)
    where
        F: FnOnce(*mut u8),
    {
        unsafe {
            let layout = Layout::from_size_align(capacity, ALIGN).unwrap();
            let base = alloc::alloc::alloc(layout);
            base.write_bytes(0x11, capacity);
            test_fn(base);
            alloc::alloc::dealloc(base, layout);
        }
    }

    fn with_heap<F>(capacity: usize, committed: usize, frame: usize, test_fn: F)
    where
        F: FnOnce(&mut Heap<TestProvider>),
    {
        with_arena(capacity, |base| {
            let provider = TestProvider {
                base,
                capacity,
                committed,
                frame,
            };
            let mut heap = unsafe { Heap::new(provider) }.unwrap();
            test_fn(&mut heap);
        });
    }

    /// Total block footprint the allocator uses for a request.
    fn fp(size: usize) -> usize {
        size.next_multiple_of(ALIGN) + OVERHEAD
    }

    fn layout_of<P>(heap: &Heap<P>) -> Vec<(usize, usize, bool)>
    where
        P: FrameProvider,
    {
        heap.blocks().map(|b| (b.offset, b.size, b.free)).collect()
    }

    #[test]
    fn init_rejects_tiny_capacity() {
        with_arena(64, |base| {
            let region = unsafe { FixedRegion::new(base, 40) };
            let err = unsafe { Heap::new(region) }.unwrap_err();
            assert!(matches!(err, HeapInitError::CapacityTooSmall { .. }));
        });
    }

    #[test]
    fn init_rejects_misaligned_base() {
        with_arena(256, |base| {
            let provider = TestProvider {
                base: unsafe { base.byte_add(8) },
                capacity: 240,
                committed: 240,
                frame: 16,
            };
            let err = unsafe { Heap::new(provider) }.unwrap_err();
            assert!(matches!(err, HeapInitError::MisalignedBase { .. }));
        });
    }

    #[test]
    fn init_rejects_bad_committed_region() {
        with_arena(4096, |base| {
            let provider = TestProvider {
                base,
                capacity: 4096,
                committed: 0,
                frame: 4096,
            };
            let err = unsafe { Heap::new(provider) }.unwrap_err();
            assert!(matches!(err, HeapInitError::CommittedTooSmall { .. }));

            let provider = TestProvider {
                base,
                capacity: 2048,
                committed: 4096,
                frame: 4096,
            };
            let err = unsafe { Heap::new(provider) }.unwrap_err();
            assert!(matches!(err, HeapInitError::CommittedOutOfBounds { .. }));
        });
    }

    #[test]
    fn basic_allocation() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(64).unwrap();
            assert_eq!(ptr.as_ptr().addr() % MIN_ALLOC_ALIGN, 0);
            ptr.as_ptr().write_bytes(0x33, 64);
            heap.check().unwrap();

            heap.free(ptr).unwrap();
            heap.check().unwrap();
            assert_eq!(heap.stats().free_bytes, 1024);
        });
    }

    #[test]
    fn interleaved_alloc_free_coalesces_all_neighbors() {
        with_heap(8192, 8192, 4096, |heap| unsafe {
            let a1 = heap.allocate(128).unwrap();
            let a2 = heap.allocate(23).unwrap();
            let a3 = heap.allocate(437).unwrap();
            heap.check().unwrap();
            assert_eq!(
                layout_of(heap),
                [
                    (0, 160, false),
                    (160, 64, false),
                    (224, 480, false),
                    (704, 7488, true),
                ]
            );

            // Freeing the rightmost allocation merges with the big tail.
            heap.free(a3).unwrap();
            heap.check().unwrap();
            assert_eq!(
                layout_of(heap),
                [(0, 160, false), (160, 64, false), (224, 7968, true)]
            );

            // Freeing the first allocation has no free neighbor.
            heap.free(a1).unwrap();
            heap.check().unwrap();
            assert_eq!(
                layout_of(heap),
                [(0, 160, true), (160, 64, false), (224, 7968, true)]
            );

            // First fit reuses the hole at the arena start, leaving a sliver.
            let a4 = heap.allocate(54).unwrap();
            assert_eq!(a4, a1);
            heap.check().unwrap();
            assert_eq!(
                layout_of(heap),
                [
                    (0, 96, false),
                    (96, 64, true),
                    (160, 64, false),
                    (224, 7968, true),
                ]
            );

            // Freeing between two free blocks merges all three.
            heap.free(a2).unwrap();
            heap.check().unwrap();
            assert_eq!(layout_of(heap), [(0, 96, false), (96, 8096, true)]);

            // The merged capacity is visible to the next big request.
            let a5 = heap.allocate(3971).unwrap();
            heap.check().unwrap();
            assert_eq!(
                layout_of(heap),
                [(0, 96, false), (96, 4016, false), (4112, 4080, true)]
            );

            heap.free(a4).unwrap();
            heap.free(a5).unwrap();
            heap.check().unwrap();
            assert_eq!(heap.stats().free_bytes, 8192);
        });
    }

    #[test]
    fn exact_fit_consumes_whole_block() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let before = layout_of(heap);
            let ptr = heap.allocate(1024 - OVERHEAD).unwrap();
            heap.check().unwrap();
            assert_eq!(layout_of(heap), [(0, 1024, false)]);
            assert_eq!(heap.stats().free_blocks, 0);

            heap.free(ptr).unwrap();
            heap.check().unwrap();
            assert_eq!(layout_of(heap), before);
        });
    }

    #[test]
    fn too_small_leftover_is_not_split() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            // Leftover would be less than one viable block; the whole block
            // is handed out instead.
            let ptr = heap.allocate(960).unwrap();
            heap.check().unwrap();
            assert_eq!(layout_of(heap), [(0, 1024, false)]);

            heap.free(ptr).unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn leftover_at_threshold_is_split() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(944).unwrap();
            heap.check().unwrap();
            assert_eq!(layout_of(heap), [(0, 976, false), (976, 48, true)]);

            heap.free(ptr).unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn out_of_memory_leaves_heap_usable() {
        with_arena(1024, |base| {
            let region = unsafe { FixedRegion::new(base, 1024) };
            let mut heap = unsafe { Heap::new(region) }.unwrap();

            let err = heap.allocate(2048).unwrap_err();
            assert!(matches!(err, AllocError::OutOfMemory { .. }));
            heap.check().unwrap();

            let ptr = heap.allocate(64).unwrap();
            unsafe { heap.free(ptr) }.unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn growth_extends_committed_region() {
        with_heap(16384, 4096, 4096, |heap| unsafe {
            let base = heap.frontier() - heap.committed();
            let ptr = heap.allocate(8000).unwrap();
            heap.check().unwrap();

            assert_eq!(heap.committed(), 8192);
            assert_eq!(heap.frontier(), base + 8192);
            assert_eq!(layout_of(heap), [(0, 8032, false), (8032, 160, true)]);

            heap.free(ptr).unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn growth_credits_trailing_free_block() {
        with_heap(16384, 4096, 1024, |heap| unsafe {
            let a = heap.allocate(2000).unwrap();
            assert_eq!(layout_of(heap), [(0, 2032, false), (2032, 2064, true)]);

            // The trailing 2064 free bytes count toward the request, so a
            // single 1024-byte frame covers the shortfall.
            let b = heap.allocate(3000).unwrap();
            heap.check().unwrap();
            assert_eq!(heap.committed(), 5120);
            assert_eq!(
                layout_of(heap),
                [(0, 2032, false), (2032, 3040, false), (5072, 48, true)]
            );

            heap.free(a).unwrap();
            heap.free(b).unwrap();
            heap.check().unwrap();
            assert_eq!(heap.stats().free_blocks, 1);
        });
    }

    #[test]
    fn growth_appends_standalone_region() {
        with_heap(8192, 4096, 4096, |heap| unsafe {
            let base = heap.frontier() - heap.committed();
            let a = heap.allocate(4096 - OVERHEAD).unwrap();
            assert_eq!(heap.stats().free_blocks, 0);

            // No trailing free block to credit; a fresh region is tiled in.
            let b = heap.allocate(100).unwrap();
            heap.check().unwrap();
            assert_eq!(b.as_ptr().addr(), base + 4096 + TAG_SIZE);
            assert_eq!(
                layout_of(heap),
                [(0, 4096, false), (4096, 144, false), (4240, 3952, true)]
            );

            heap.free(a).unwrap();
            heap.free(b).unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn growth_stops_at_capacity() {
        with_heap(4096, 4096, 4096, |heap| {
            let err = heap.allocate(4096).unwrap_err();
            assert!(matches!(err, AllocError::OutOfMemory { .. }));
            heap.check().unwrap();
        });

        with_heap(8192, 4096, 4096, |heap| {
            // Even with growth, the request cannot fit under the ceiling.
            let err = heap.allocate(8192).unwrap_err();
            assert!(matches!(err, AllocError::OutOfMemory { .. }));
            heap.check().unwrap();
        });
    }

    #[test]
    fn double_free_is_detected() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(64).unwrap();
            heap.free(ptr).unwrap();

            let err = heap.free(ptr).unwrap_err();
            assert!(matches!(err, FreeError::DoubleFree { .. }));
            heap.check().unwrap();
        });
    }

    #[test]
    fn foreign_pointers_are_detected() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(128).unwrap();
            ptr.as_ptr().write_bytes(0x33, 128);

            // Aligned, in-arena, but points into payload bytes.
            let inside = NonNull::new(ptr.as_ptr().byte_add(64)).unwrap();
            let err = heap.free(inside).unwrap_err();
            assert!(matches!(err, FreeError::ForeignPointer { .. }));

            // Unaligned.
            let unaligned = NonNull::new(ptr.as_ptr().byte_add(8)).unwrap();
            let err = heap.free(unaligned).unwrap_err();
            assert!(matches!(err, FreeError::ForeignPointer { .. }));

            // Entirely outside the arena.
            let mut elsewhere = [0_u8; 64];
            let outside = NonNull::new(elsewhere.as_mut_ptr()).unwrap();
            let err = heap.free(outside).unwrap_err();
            assert!(matches!(err, FreeError::ForeignPointer { .. }));

            heap.free(ptr).unwrap();
            heap.check().unwrap();
        });
    }

    #[test]
    fn corrupted_header_size_is_detected() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(128).unwrap();

            // Scribble over the header's size word.
            let size_word = ptr.as_ptr().byte_sub(TAG_SIZE).cast::<usize>();
            size_word.write(4096);

            let err = heap.free(ptr).unwrap_err();
            assert!(matches!(err, FreeError::CorruptedMetadata { .. }));
        });
    }

    #[test]
    fn corrupted_footer_is_detected() {
        with_heap(1024, 1024, 1024, |heap| unsafe {
            let ptr = heap.allocate(128).unwrap();

            // The 160-byte block's footer sits 128 bytes into the payload.
            let footer_size = ptr.as_ptr().byte_add(128).cast::<usize>();
            footer_size.write(96);

            let err = heap.free(ptr).unwrap_err();
            assert!(matches!(err, FreeError::CorruptedMetadata { .. }));
            assert!(heap.check().is_err());
        });
    }

    #[test]
    fn alloc_free_round_trip_restores_shape() {
        with_heap(8192, 8192, 4096, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(200).unwrap();
            heap.free(a).unwrap();
            let before = layout_of(heap);

            let c = heap.allocate(500).unwrap();
            heap.free(c).unwrap();
            assert_eq!(layout_of(heap), before);

            // Same when the allocation lands in the leading hole.
            let d = heap.allocate(50).unwrap();
            heap.free(d).unwrap();
            assert_eq!(layout_of(heap), before);
            heap.check().unwrap();
        });
    }

    #[test]
    fn live_allocations_never_overlap() {
        with_heap(8192, 8192, 4096, |heap| unsafe {
            let sizes = [8_usize, 100, 23, 437, 54, 256, 1000];
            let mut ranges = Vec::new();
            for size in sizes {
                let ptr = heap.allocate(size).unwrap();
                ptr.as_ptr().write_bytes(0x33, size);
                ranges.push((ptr, ptr.as_ptr().addr(), size));
            }
            heap.check().unwrap();

            for (i, &(_, start_a, len_a)) in ranges.iter().enumerate() {
                for &(_, start_b, len_b) in &ranges[i + 1..] {
                    assert!(start_a + len_a <= start_b || start_b + len_b <= start_a);
                }
            }

            for (ptr, _, _) in ranges {
                heap.free(ptr).unwrap();
            }
            heap.check().unwrap();
            assert_eq!(heap.stats().free_blocks, 1);
        });
    }

    #[test]
    fn alloc_until_oom_then_recover() {
        with_arena(2048, |base| {
            let region = unsafe { FixedRegion::new(base, 2048) };
            let mut heap = unsafe { Heap::new(region) }.unwrap();

            let mut ptrs = Vec::new();
            while let Ok(ptr) = heap.allocate(64) {
                ptrs.push(ptr);
            }
            assert!(ptrs.len() >= 2048 / fp(64) - 1);
            heap.check().unwrap();

            for ptr in ptrs {
                unsafe { heap.free(ptr) }.unwrap();
            }
            heap.check().unwrap();
            assert_eq!(heap.stats().free_bytes, 2048);

            let ptr = heap.allocate(1024).unwrap();
            unsafe { heap.free(ptr) }.unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "allocation size must be nonzero")]
    fn zero_size_allocation_panics() {
        with_heap(1024, 1024, 1024, |heap| {
            let _ = heap.allocate(0);
        });
    }
}

