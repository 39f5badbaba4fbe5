//! The allocation engine: malloc, free, realloc, and friends.
//!
//! Every request is padded to one header plus the payload, rounded up
//! to chunk granularity. Allocation scans the free-list buckets from
//! the request's size class upward and carves the first chunk that
//! fits; release coalesces with both physical neighbors before
//! relinking. Failed requests return an error and leave the heap
//! exactly as it was.

use core::ptr::{self, NonNull};

use snafu::{Snafu, ensure};

use crate::{
    heap::{Heap, HeapData},
    node::{
        ALLOC_BIT, AllocNode, FreeNode, HEADER_SIZE, MIN_CHUNK, NNODES, SIZE_MASK,
        checked_align_up, is_allocated, size2ndx,
    },
};

/// Why an allocation request could not be satisfied. The heap is never
/// mutated by a failed request, except that `realloc` to size zero
/// releases the old allocation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    /// Zero-byte requests are rejected rather than given a unique
    /// pointer.
    #[snafu(display("allocation size must be nonzero"))]
    SizeIsZero {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// Padding the request overflowed the representable chunk size.
    #[snafu(display("request of {size} bytes overflows when padded"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// `memalign` requires a power-of-two alignment.
    #[snafu(display("alignment {alignment} is not a power of two"))]
    BadAlignment {
        alignment: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The element count times element size overflowed.
    #[snafu(display("{count} elements of {elem_size} bytes overflow the address space"))]
    CountOverflow {
        count: usize,
        elem_size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// No free chunk is large enough for the request.
    #[snafu(display("no free chunk can satisfy {size} bytes"))]
    Exhausted {
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// A multi-heap call named a heap index that does not exist.
    #[snafu(display("heap index {index} is out of range"))]
    BadHeapIndex {
        index: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Pads `size` to a full chunk: header plus payload, rounded up to
/// granularity, and still representable under the allocated-bit mask.
fn request_size(size: usize) -> Result<usize, AllocError> {
    ensure!(size != 0, SizeIsZeroSnafu);
    size.checked_add(HEADER_SIZE)
        .and_then(checked_align_up)
        .filter(|&padded| padded < ALLOC_BIT)
        .ok_or_else(|| SizeOverflowSnafu { size }.build())
}

impl HeapData {
    /// Finds and carves a chunk of exactly-or-more `aligned` bytes, or
    /// returns `None` when the structure has nothing large enough.
    pub(crate) unsafe fn malloc_chunk(&mut self, aligned: usize) -> Option<*mut AllocNode> {
        for ndx in size2ndx(aligned)..NNODES {
            let mut cursor = self.buckets[ndx];
            while !cursor.is_null() {
                unsafe {
                    // buckets are sorted ascending, so the first chunk
                    // that fits is the smallest one that does
                    if (*cursor).size >= aligned {
                        return Some(self.carve(cursor, aligned));
                    }
                    cursor = (*cursor).flink;
                }
            }
        }
        None
    }

    /// Unlinks `node`, splits off any tail remainder that can stand
    /// alone, and marks the leading part allocated.
    unsafe fn carve(&mut self, node: *mut FreeNode, aligned: usize) -> *mut AllocNode {
        unsafe {
            self.remove_free_chunk(node);
            let remainder = (*node).size - aligned;
            if remainder >= MIN_CHUNK {
                let after = node.byte_add((*node).size).cast::<AllocNode>();
                let split = node.byte_add(aligned).cast::<FreeNode>();
                (*split).size = remainder;
                (*split).preceding = aligned;
                (*node).size = aligned;
                (*after).preceding = remainder | ((*after).preceding & ALLOC_BIT);
                self.add_free_chunk(split);
            }
            (*node).preceding |= ALLOC_BIT;
            node.cast::<AllocNode>()
        }
    }

    /// Returns an allocated chunk to the structure, coalescing with
    /// free physical neighbors first.
    pub(crate) unsafe fn free_chunk(&mut self, node: *mut AllocNode) {
        unsafe {
            assert!(
                is_allocated((*node).preceding),
                "double free or corrupted chunk header"
            );
            let mut node = node.cast::<FreeNode>();
            (*node).preceding &= SIZE_MASK;

            // merge with the following chunk if it is free
            let next = node.byte_add((*node).size).cast::<FreeNode>();
            if !is_allocated((*next).preceding) {
                let after = next.byte_add((*next).size).cast::<AllocNode>();
                self.remove_free_chunk(next);
                (*node).size += (*next).size;
                (*after).preceding = (*node).size | ((*after).preceding & ALLOC_BIT);
            }

            // merge with the preceding chunk if it is free
            let prev = node.byte_sub((*node).preceding).cast::<FreeNode>();
            if !is_allocated((*prev).preceding) {
                let after = node.byte_add((*node).size).cast::<AllocNode>();
                self.remove_free_chunk(prev);
                (*prev).size += (*node).size;
                (*after).preceding = (*prev).size | ((*after).preceding & ALLOC_BIT);
                node = prev;
            }

            self.add_free_chunk(node);
        }
    }

    /// Trims an allocated chunk down to `aligned` bytes. The freed tail
    /// is merged into a following free chunk when there is one, split
    /// off as a new free chunk when it can stand alone, and otherwise
    /// left attached as slack.
    pub(crate) unsafe fn shrink_chunk(&mut self, node: *mut AllocNode, aligned: usize) {
        unsafe {
            let next = node.byte_add((*node).size).cast::<FreeNode>();
            if !is_allocated((*next).preceding) {
                let after = next.byte_add((*next).size).cast::<AllocNode>();
                let merged = (*next).size + ((*node).size - aligned);
                self.remove_free_chunk(next);
                let moved = node.byte_add(aligned).cast::<FreeNode>();
                (*moved).size = merged;
                (*moved).preceding = aligned;
                (*node).size = aligned;
                (*after).preceding = merged | ((*after).preceding & ALLOC_BIT);
                self.add_free_chunk(moved);
            } else if (*node).size - aligned >= MIN_CHUNK {
                let split = node.byte_add(aligned).cast::<FreeNode>();
                (*split).size = (*node).size - aligned;
                (*split).preceding = aligned;
                (*node).size = aligned;
                (*next).preceding = (*split).size | ALLOC_BIT;
                self.add_free_chunk(split);
            }
        }
    }
}

impl Heap {
    /// Allocates at least `size` bytes. The returned pointer is aligned
    /// to chunk granularity.
    #[track_caller]
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let aligned = request_size(size)?;
        #[cfg(feature = "heapinfo")]
        let caller = core::panic::Location::caller();
        let mut data = self.inner.lock();
        let Some(node) = (unsafe { data.malloc_chunk(aligned) }) else {
            log::debug!("mm: allocation of {size} bytes failed");
            return ExhaustedSnafu { size }.fail();
        };
        unsafe {
            #[cfg(feature = "heapinfo")]
            {
                let owner = crate::task::current_id();
                crate::heapinfo::stamp(node, caller, owner);
                data.usage.on_alloc((*node).size, owner);
            }
            Ok(NonNull::new_unchecked(node.cast::<u8>().byte_add(HEADER_SIZE)))
        }
    }

    /// Allocates at least `size` zeroed bytes.
    #[track_caller]
    pub fn zalloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let mem = self.malloc(size)?;
        unsafe {
            ptr::write_bytes(mem.as_ptr(), 0, size);
        }
        Ok(mem)
    }

    /// Allocates zeroed storage for `count` elements of `elem_size`
    /// bytes each.
    #[track_caller]
    pub fn calloc(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(total) = count.checked_mul(elem_size) else {
            return CountOverflowSnafu { count, elem_size }.fail();
        };
        self.zalloc(total)
    }

    /// Allocates at least `size` bytes whose address is a multiple of
    /// `alignment`. `alignment` must be a power of two; alignments at
    /// or below chunk granularity fall through to [`malloc`](Self::malloc).
    #[track_caller]
    pub fn memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        ensure!(alignment.is_power_of_two(), BadAlignmentSnafu { alignment });
        if alignment <= MIN_CHUNK {
            return self.malloc(size);
        }
        ensure!(size != 0, SizeIsZeroSnafu);
        #[cfg(feature = "heapinfo")]
        let caller = core::panic::Location::caller();

        // over-allocate so an aligned payload boundary is guaranteed to
        // fall inside the raw chunk with room for a header before it
        let alloc_size = checked_align_up(size)
            .and_then(|padded| padded.checked_add(2 * HEADER_SIZE + alignment))
            .filter(|&total| total < ALLOC_BIT)
            .ok_or_else(|| SizeOverflowSnafu { size }.build())?;
        let raw = self.malloc(alloc_size - HEADER_SIZE)?;

        let mut data = self.inner.lock();
        unsafe {
            let mut node = raw.as_ptr().byte_sub(HEADER_SIZE).cast::<AllocNode>();
            #[cfg(feature = "heapinfo")]
            let raw_size = (*node).size;
            let mask = alignment - 1;
            let raw_addr = raw.as_ptr().addr();
            let aligned_addr = (raw_addr + mask) & !mask;

            if aligned_addr != raw_addr {
                // give the leading remainder back as its own chunk;
                // payload granularity guarantees it can stand alone
                let preceding_size = aligned_addr - raw_addr;
                debug_assert!(preceding_size >= MIN_CHUNK);
                let new_node = raw
                    .as_ptr()
                    .with_addr(aligned_addr - HEADER_SIZE)
                    .cast::<AllocNode>();
                let after = node.byte_add((*node).size).cast::<AllocNode>();
                let new_size = (*node).size - preceding_size;
                (*new_node).size = new_size;
                (*new_node).preceding = preceding_size | ALLOC_BIT;
                (*node).size = preceding_size;
                (*after).preceding = new_size | ((*after).preceding & ALLOC_BIT);
                data.free_chunk(node);
                node = new_node;
            }

            // trim slack past the requested payload
            let needed = request_size(size)?;
            if (*node).size - needed >= MIN_CHUNK {
                data.shrink_chunk(node, needed);
            }

            #[cfg(feature = "heapinfo")]
            {
                let owner = crate::task::current_id();
                data.usage.on_free(raw_size, owner);
                data.usage.on_alloc((*node).size, owner);
                crate::heapinfo::stamp(node, caller, owner);
            }
            Ok(NonNull::new_unchecked(raw.as_ptr().with_addr(aligned_addr)))
        }
    }

    /// Releases an allocation.
    ///
    /// # Panics
    ///
    /// Panics if `mem` is not owned by this heap or the chunk header is
    /// not marked allocated; both indicate heap corruption or a double
    /// free.
    ///
    /// # Safety
    ///
    /// `mem` must have been returned by one of this heap's allocation
    /// calls and not freed since.
    pub unsafe fn free(&self, mem: NonNull<u8>) {
        let mut data = self.inner.lock();
        assert!(
            data.contains(mem.as_ptr().addr()),
            "free of address not owned by this heap"
        );
        unsafe {
            let node = mem.as_ptr().byte_sub(HEADER_SIZE).cast::<AllocNode>();
            #[cfg(feature = "heapinfo")]
            {
                assert!(
                    is_allocated((*node).preceding),
                    "double free or corrupted chunk header"
                );
                data.usage.on_free((*node).size, (*node).owner);
            }
            data.free_chunk(node);
        }
    }

    /// Resizes an allocation, preserving the payload prefix.
    ///
    /// Shrinking always succeeds in place. Growing first tries to
    /// absorb a free chunk that physically follows; otherwise the data
    /// moves to a fresh allocation and the old chunk is released. A
    /// null `oldmem` behaves as [`malloc`](Self::malloc); a zero `size`
    /// releases `oldmem` and reports [`AllocError::SizeIsZero`].
    ///
    /// # Safety
    ///
    /// `oldmem` must be null or a live allocation from this heap.
    #[track_caller]
    pub unsafe fn realloc(&self, oldmem: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(old) = NonNull::new(oldmem) else {
            return self.malloc(size);
        };
        if size == 0 {
            unsafe { self.free(old) };
            return SizeIsZeroSnafu.fail();
        }
        let aligned = request_size(size)?;
        #[cfg(feature = "heapinfo")]
        let caller = core::panic::Location::caller();

        let mut data = self.inner.lock();
        assert!(
            data.contains(old.addr().get()),
            "realloc of address not owned by this heap"
        );
        unsafe {
            let node = old.as_ptr().byte_sub(HEADER_SIZE).cast::<AllocNode>();
            assert!(
                is_allocated((*node).preceding),
                "realloc of a chunk that is not allocated"
            );
            let old_size = (*node).size;
            #[cfg(feature = "heapinfo")]
            let owner = (*node).owner;

            if aligned <= old_size {
                data.shrink_chunk(node, aligned);
                #[cfg(feature = "heapinfo")]
                {
                    data.usage.on_free(old_size, owner);
                    data.usage.on_alloc((*node).size, owner);
                }
                return Ok(old);
            }

            // grow in place by absorbing a following free chunk
            let next = node.byte_add(old_size).cast::<FreeNode>();
            if !is_allocated((*next).preceding) && old_size + (*next).size >= aligned {
                let after = next.byte_add((*next).size).cast::<AllocNode>();
                data.remove_free_chunk(next);
                (*node).size = old_size + (*next).size;
                (*after).preceding = (*node).size | ((*after).preceding & ALLOC_BIT);
                if (*node).size - aligned >= MIN_CHUNK {
                    data.shrink_chunk(node, aligned);
                }
                #[cfg(feature = "heapinfo")]
                {
                    data.usage.on_free(old_size, owner);
                    data.usage.on_alloc((*node).size, owner);
                    crate::heapinfo::stamp(node, caller, owner);
                }
                return Ok(old);
            }

            // move: allocate, copy the surviving payload, release
            let Some(new_node) = data.malloc_chunk(aligned) else {
                log::debug!("mm: reallocation to {size} bytes failed");
                return ExhaustedSnafu { size }.fail();
            };
            let new_mem = new_node.cast::<u8>().byte_add(HEADER_SIZE);
            let surviving = old_size.min(aligned) - HEADER_SIZE;
            ptr::copy_nonoverlapping(old.as_ptr().cast_const(), new_mem, surviving);
            #[cfg(feature = "heapinfo")]
            {
                let new_owner = crate::task::current_id();
                crate::heapinfo::stamp(new_node, caller, new_owner);
                data.usage.on_alloc((*new_node).size, new_owner);
                data.usage.on_free(old_size, owner);
            }
            data.free_chunk(node);
            Ok(NonNull::new_unchecked(new_mem))
        }
    }
}
