//! Heap instances: region registration, address classification, and
//! introspection.
//!
//! A [`Heap`] owns up to [`MAX_REGIONS`] disjoint spans of raw memory.
//! Each registered region is bracketed by two permanently-allocated
//! sentinel chunks with zero payload; the sentinels stop coalescing and
//! chunk walks at region boundaries, so chunks from different regions
//! can never merge. All heap state is protected by a single reentrant
//! guard; every operation acquires it for its full duration.
//!
//! A deployment may construct any number of independent heaps (kernel
//! heap, per-process heaps); heaps never share regions. See
//! [`HeapSet`](crate::multiheap::HeapSet) for address-based routing
//! between instances.

use arrayvec::ArrayVec;
use snafu::{Snafu, ensure};

use crate::{
    lock::ReentrantMutex,
    node::{
        ALLOC_BIT, AllocNode, FreeNode, HEADER_SIZE, MIN_CHUNK, NNODES, align_down, align_up,
        is_allocated, preceding_size,
    },
};

/// Maximum number of disjoint regions one heap can own.
pub const MAX_REGIONS: usize = 4;

/// Failures while registering or extending a region. The heap is left
/// unchanged in every case.
#[derive(Debug, Snafu)]
pub enum RegionError {
    /// The span cannot hold two sentinels plus one minimum chunk.
    #[snafu(display("region of {size} bytes cannot hold a chunk"))]
    RegionTooSmall {
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The heap already owns its maximum number of regions.
    #[snafu(display("region table is full ({max} regions)"))]
    RegionTableFull {
        max: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// No region with that index exists.
    #[snafu(display("region index {index} is out of range"))]
    BadRegionIndex {
        index: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// One registered span, identified by its sentinel headers.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    pub(crate) head: *mut AllocNode,
    pub(crate) tail: *mut AllocNode,
}

/// The guarded part of a heap: region table, free-list buckets, and
/// usage counters.
pub(crate) struct HeapData {
    pub(crate) regions: ArrayVec<Region, MAX_REGIONS>,
    /// Bucket heads of the segregated free lists; null means empty.
    pub(crate) buckets: [*mut FreeNode; NNODES],
    /// Usable bytes across all regions (sentinel overhead excluded).
    pub(crate) heap_size: usize,
    #[cfg(feature = "heapinfo")]
    pub(crate) usage: crate::heapinfo::HeapUsage,
}

// The raw pointers reference chunk memory owned exclusively by this
// heap and only touched under its guard.
unsafe impl Send for HeapData {}

impl HeapData {
    const fn new() -> Self {
        Self {
            regions: ArrayVec::new_const(),
            buckets: [core::ptr::null_mut(); NNODES],
            heap_size: 0,
            #[cfg(feature = "heapinfo")]
            usage: crate::heapinfo::HeapUsage::new(),
        }
    }

    /// Whether `addr` lies strictly inside one of the registered
    /// regions (between, not on, the sentinels).
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.regions
            .iter()
            .any(|region| addr > region.head.addr() && addr < region.tail.addr())
    }

    unsafe fn install_region(&mut self, start: *mut u8, size: usize) -> Result<(), RegionError> {
        ensure!(
            !self.regions.is_full(),
            RegionTableFullSnafu { max: MAX_REGIONS }
        );

        // Trim the span to granularity before carving it up.
        let base = align_up(start.addr());
        let end = align_down(start.addr().saturating_add(size));
        ensure!(
            end > base && end - base >= 2 * HEADER_SIZE + MIN_CHUNK,
            RegionTooSmallSnafu { size }
        );
        let free_size = end - base - 2 * HEADER_SIZE;

        let head = start.with_addr(base).cast::<AllocNode>();
        let tail = start.with_addr(end - HEADER_SIZE).cast::<AllocNode>();
        let free = start.with_addr(base + HEADER_SIZE).cast::<FreeNode>();
        unsafe {
            head.write(AllocNode::new(HEADER_SIZE, ALLOC_BIT));
            tail.write(AllocNode::new(HEADER_SIZE, free_size | ALLOC_BIT));
            (*free).size = free_size;
            (*free).preceding = HEADER_SIZE;
            self.add_free_chunk(free);
        }

        self.regions.push(Region { head, tail });
        self.heap_size += free_size;
        log::debug!("mm: region {base:#x}..{end:#x} registered, {free_size} usable bytes");
        Ok(())
    }
}

/// Walks every chunk of every region in physical order, sentinels
/// excluded, checking the boundary-tag invariant as it goes.
fn walk_chunks(data: &HeapData, mut f: impl FnMut(*const AllocNode)) {
    for region in &data.regions {
        let mut prev_size = HEADER_SIZE;
        let mut addr = region.head.addr() + HEADER_SIZE;
        while addr < region.tail.addr() {
            let node = region.head.with_addr(addr).cast_const();
            unsafe {
                let size = (*node).size;
                assert!(size >= MIN_CHUNK, "corrupted chunk size in heap walk");
                assert_eq!(
                    preceding_size((*node).preceding),
                    prev_size,
                    "boundary tag out of sync with preceding chunk"
                );
                f(node);
                prev_size = size;
                addr += size;
            }
        }
        assert_eq!(addr, region.tail.addr(), "chunk walk overran the region");
        unsafe {
            assert_eq!(
                preceding_size((*region.tail).preceding),
                prev_size,
                "tail sentinel boundary tag out of sync"
            );
        }
    }
}

/// Aggregate usage figures for one heap, computed by a guarded walk of
/// all regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Usable bytes owned by the heap (sentinel overhead excluded).
    pub arena: usize,
    /// Bytes in allocated chunks, headers included.
    pub in_use: usize,
    /// Bytes in free chunks.
    pub free: usize,
    /// Size of the largest single free chunk.
    pub largest_free: usize,
    /// Number of free chunks.
    pub free_chunks: usize,
}

/// A single chunk as reported by [`Heap::for_each_chunk`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    /// Address of the chunk header.
    pub addr: usize,
    /// Total chunk size in bytes, header included.
    pub size: usize,
    pub allocated: bool,
    /// Source location of the allocating call (allocated chunks only).
    #[cfg(feature = "heapinfo")]
    pub caller: Option<&'static core::panic::Location<'static>>,
    /// Task that allocated the chunk (allocated chunks only).
    #[cfg(feature = "heapinfo")]
    pub owner: u32,
}

/// One allocator instance, owning its regions, free-list structure, and
/// guard.
pub struct Heap {
    pub(crate) inner: ReentrantMutex<HeapData>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates an empty heap with no regions. Suitable for statics;
    /// register memory with [`initialize`](Self::initialize) before
    /// allocating.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(HeapData::new()),
        }
    }

    /// Registers the heap's first region.
    ///
    /// # Panics
    ///
    /// Panics if the heap already has a region.
    ///
    /// # Safety
    ///
    /// The span `start..start + size` must be valid, unused by anything
    /// else, and must remain valid for the lifetime of the heap.
    pub unsafe fn initialize(&self, start: *mut u8, size: usize) -> Result<(), RegionError> {
        let mut data = self.inner.lock();
        assert!(data.regions.is_empty(), "heap is already initialized");
        unsafe { data.install_region(start, size) }
    }

    /// Registers an additional disjoint region.
    ///
    /// # Safety
    ///
    /// Same as [`initialize`](Self::initialize); the span must also be
    /// disjoint from every region already registered with any heap.
    pub unsafe fn add_region(&self, start: *mut u8, size: usize) -> Result<(), RegionError> {
        let mut data = self.inner.lock();
        unsafe { data.install_region(start, size) }
    }

    /// Grows region `region` in place with a span that starts exactly
    /// at the region's current end.
    ///
    /// The old tail sentinel is converted into an ordinary chunk
    /// covering the added span, freed into the structure (coalescing
    /// with a trailing free chunk if there is one), and a new tail
    /// sentinel is installed at the new end.
    ///
    /// # Panics
    ///
    /// Panics if `mem` is not contiguous with the region's current end.
    ///
    /// # Safety
    ///
    /// `mem..mem + size` must be valid, unused, physically contiguous
    /// with the region, and part of the same underlying allocation.
    pub unsafe fn extend(
        &self,
        mem: *mut u8,
        size: usize,
        region: usize,
    ) -> Result<(), RegionError> {
        let mut data = self.inner.lock();
        ensure!(
            region < data.regions.len(),
            BadRegionIndexSnafu { index: region }
        );
        let old_tail = data.regions[region].tail;
        assert_eq!(
            mem.addr(),
            old_tail.addr() + HEADER_SIZE,
            "extension is not contiguous with the region end"
        );

        let block_end = align_down(mem.addr().saturating_add(size));
        let added = block_end.saturating_sub(mem.addr());
        ensure!(added >= MIN_CHUNK, RegionTooSmallSnafu { size });

        unsafe {
            // The old tail sentinel becomes an ordinary allocated chunk
            // covering the added span, then is released.
            let new_tail = mem.with_addr(block_end - HEADER_SIZE).cast::<AllocNode>();
            (*old_tail).size = added;
            new_tail.write(AllocNode::new(HEADER_SIZE, added | ALLOC_BIT));
            data.regions[region].tail = new_tail;
            data.heap_size += added;
            data.free_chunk(old_tail);
        }
        log::debug!("mm: region {region} extended by {added} bytes");
        Ok(())
    }

    /// Current break address of region `region`: one past its tail
    /// sentinel, which is where an [`extend`](Self::extend) span must
    /// begin.
    pub fn break_addr(&self, region: usize) -> Result<*mut u8, RegionError> {
        let data = self.inner.lock();
        ensure!(
            region < data.regions.len(),
            BadRegionIndexSnafu { index: region }
        );
        Ok(unsafe { data.regions[region].tail.cast::<u8>().byte_add(HEADER_SIZE) })
    }

    /// Moves region `region`'s break up by `increment` bytes, returning
    /// the previous break address. The span between the old and new
    /// break is freed into the structure.
    ///
    /// # Safety
    ///
    /// The `increment` bytes starting at the current break must satisfy
    /// the requirements of [`extend`](Self::extend).
    pub unsafe fn sbrk(&self, increment: usize, region: usize) -> Result<*mut u8, RegionError> {
        // hold the guard across the query and the growth; extend
        // re-enters it
        let _guard = self.inner.lock();
        let brk = self.break_addr(region)?;
        unsafe { self.extend(brk, increment, region)? };
        Ok(brk)
    }

    /// Whether `mem` points into one of this heap's regions.
    pub fn contains(&self, mem: *const u8) -> bool {
        self.inner.lock().contains(mem.addr())
    }

    /// Number of registered regions.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Task currently holding the heap's guard, if any.
    pub fn holder(&self) -> Option<u32> {
        self.inner.holder()
    }

    /// Runs `f` while holding the heap's guard.
    ///
    /// Allocator calls made from inside `f` re-enter the guard instead
    /// of deadlocking, so a task can make a multi-step sequence of heap
    /// operations atomic with respect to other tasks.
    pub fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock();
        f()
    }

    /// Like [`guarded`](Self::guarded) but returns `None` instead of
    /// spinning when another task holds the guard.
    pub fn try_guarded<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.inner.try_lock()?;
        Some(f())
    }

    /// Computes aggregate usage figures with a full guarded walk.
    pub fn stats(&self) -> HeapStats {
        let data = self.inner.lock();
        let mut stats = HeapStats {
            arena: data.heap_size,
            ..HeapStats::default()
        };
        walk_chunks(&data, |node| unsafe {
            let size = (*node).size;
            if is_allocated((*node).preceding) {
                stats.in_use += size;
            } else {
                stats.free += size;
                stats.largest_free = stats.largest_free.max(size);
                stats.free_chunks += 1;
            }
        });
        stats
    }

    /// Reports every chunk of every region in physical order, under the
    /// guard. Never mutates allocator state.
    pub fn for_each_chunk(&self, mut f: impl FnMut(ChunkInfo)) {
        let data = self.inner.lock();
        walk_chunks(&data, |node| unsafe {
            let allocated = is_allocated((*node).preceding);
            f(ChunkInfo {
                addr: node.addr(),
                size: (*node).size,
                allocated,
                #[cfg(feature = "heapinfo")]
                caller: if allocated { (*node).caller } else { None },
                #[cfg(feature = "heapinfo")]
                owner: if allocated { (*node).owner } else { 0 },
            });
        });
    }

    /// Snapshot of the heap's running usage totals.
    #[cfg(feature = "heapinfo")]
    pub fn usage(&self) -> crate::heapinfo::HeapUsage {
        self.inner.lock().usage.clone()
    }

    /// Marks the allocation holding `mem` as stack memory so it is not
    /// counted against its owner's heap usage.
    ///
    /// # Safety
    ///
    /// `mem` must be a live allocation returned by this heap.
    #[cfg(feature = "heapinfo")]
    pub unsafe fn exclude_stack(&self, mem: core::ptr::NonNull<u8>) {
        let mut data = self.inner.lock();
        assert!(
            data.contains(mem.as_ptr().addr()),
            "stack exclusion for address not owned by this heap"
        );
        unsafe {
            let node = mem.as_ptr().byte_sub(HEADER_SIZE).cast::<AllocNode>();
            assert!(is_allocated((*node).preceding), "stack chunk is not allocated");
            let (size, owner) = ((*node).size, (*node).owner);
            data.usage.exclude_stack(size, owner);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::size2ndx;

    fn with_raw_heap<F>(size: usize, f: F)
    where
        F: FnOnce(*mut u8, usize),
    {
        unsafe {
            let layout = std::alloc::Layout::from_size_align(size, MIN_CHUNK).unwrap();
            let base = std::alloc::alloc(layout);
            base.write_bytes(0x11, size);
            f(base, size);
            std::alloc::dealloc(base, layout);
        }
    }

    #[test]
    fn test_initialize_installs_one_free_chunk() {
        with_raw_heap(4096, |base, size| unsafe {
            let heap = Heap::new();
            heap.initialize(base, size).unwrap();
            let stats = heap.stats();
            assert_eq!(stats.arena, size - 2 * HEADER_SIZE);
            assert_eq!(stats.free, stats.arena);
            assert_eq!(stats.in_use, 0);
            assert_eq!(stats.free_chunks, 1);
            assert_eq!(stats.largest_free, stats.arena);
        });
    }

    #[test]
    fn test_initialize_trims_unaligned_span() {
        with_raw_heap(4096, |base, _| unsafe {
            let heap = Heap::new();
            heap.initialize(base.add(1), 4095).unwrap();
            let stats = heap.stats();
            assert_eq!(stats.arena, 4096 - MIN_CHUNK - 2 * HEADER_SIZE);
        });
    }

    #[test]
    fn test_too_small_region_is_rejected() {
        with_raw_heap(4096, |base, _| unsafe {
            let heap = Heap::new();
            let err = heap.initialize(base, 2 * HEADER_SIZE).unwrap_err();
            assert!(matches!(err, RegionError::RegionTooSmall { .. }));
            assert_eq!(heap.region_count(), 0);
        });
    }

    #[test]
    fn test_region_table_capacity() {
        with_raw_heap(MAX_REGIONS * 1024 + 1024, |base, _| unsafe {
            let heap = Heap::new();
            heap.initialize(base, 1024).unwrap();
            for region in 1..MAX_REGIONS {
                heap.add_region(base.add(region * 1024), 1024).unwrap();
            }
            let err = heap.add_region(base.add(MAX_REGIONS * 1024), 1024).unwrap_err();
            assert!(matches!(err, RegionError::RegionTableFull { .. }));
            assert_eq!(heap.region_count(), MAX_REGIONS);
        });
    }

    #[test]
    fn test_contains_is_bounded_by_sentinels() {
        with_raw_heap(4096, |base, size| unsafe {
            let heap = Heap::new();
            heap.initialize(base, size).unwrap();
            assert!(!heap.contains(base));
            assert!(heap.contains(base.add(2 * HEADER_SIZE)));
            assert!(!heap.contains(base.add(size)));
            assert!(!heap.contains(core::ptr::null()));
        });
    }

    #[test]
    fn test_extend_grows_the_free_span() {
        with_raw_heap(8192, |base, _| unsafe {
            let heap = Heap::new();
            heap.initialize(base, 4096).unwrap();
            let before = heap.stats();
            heap.extend(base.add(4096), 4096, 0).unwrap();
            let after = heap.stats();
            assert_eq!(after.arena, before.arena + 4096);
            // the added span coalesces with the original free chunk
            assert_eq!(after.free_chunks, 1);
            assert_eq!(after.largest_free, before.largest_free + 4096);
        });
    }

    #[test]
    fn test_sbrk_moves_the_break() {
        with_raw_heap(8192, |base, _| unsafe {
            let heap = Heap::new();
            heap.initialize(base, 4096).unwrap();
            assert_eq!(heap.break_addr(0).unwrap(), base.add(4096));

            let before = heap.stats();
            let old_break = heap.sbrk(4096, 0).unwrap();
            assert_eq!(old_break, base.add(4096));
            assert_eq!(heap.break_addr(0).unwrap(), base.add(8192));

            let after = heap.stats();
            assert_eq!(after.arena, before.arena + 4096);
            assert_eq!(after.free_chunks, 1);
        });
    }

    #[test]
    fn test_break_of_unknown_region_fails() {
        with_raw_heap(4096, |base, size| unsafe {
            let heap = Heap::new();
            heap.initialize(base, size).unwrap();
            let err = heap.break_addr(3).unwrap_err();
            assert!(matches!(err, RegionError::BadRegionIndex { .. }));
            let err = heap.sbrk(1024, 3).unwrap_err();
            assert!(matches!(err, RegionError::BadRegionIndex { .. }));
        });
    }

    #[test]
    fn test_extend_of_unknown_region_fails() {
        with_raw_heap(4096, |base, size| unsafe {
            let heap = Heap::new();
            heap.initialize(base, size).unwrap();
            let err = heap.extend(base.add(size), 1024, 7).unwrap_err();
            assert!(matches!(err, RegionError::BadRegionIndex { .. }));
        });
    }

    #[test]
    fn test_initial_chunk_lands_in_its_size_bucket() {
        with_raw_heap(4096, |base, size| unsafe {
            let heap = Heap::new();
            heap.initialize(base, size).unwrap();
            let data = heap.inner.lock();
            let ndx = size2ndx(size - 2 * HEADER_SIZE);
            assert!(!data.buckets[ndx].is_null());
            for (other, bucket) in data.buckets.iter().enumerate() {
                if other != ndx {
                    assert!(bucket.is_null());
                }
            }
        });
    }
}
