//! Routing across a fixed set of independent heaps.
//!
//! A [`HeapSet`] owns `N` heaps, addressed either explicitly by index
//! (the `*_at` family) or implicitly by the address being released or
//! resized. Heaps never share regions, so every address maps to at
//! most one heap.

use core::ptr::NonNull;

use crate::{
    alloc::{AllocError, BadHeapIndexSnafu},
    heap::Heap,
};

/// A fixed array of independent heaps with address-based routing.
pub struct HeapSet<const N: usize> {
    heaps: [Heap; N],
}

impl<const N: usize> Default for HeapSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HeapSet<N> {
    /// Creates `N` empty heaps. Register regions with each via
    /// [`heap`](Self::heap) before allocating.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heaps: [const { Heap::new() }; N],
        }
    }

    /// The heap at `index`.
    pub fn heap(&self, index: usize) -> Result<&Heap, AllocError> {
        self.heaps
            .get(index)
            .ok_or_else(|| BadHeapIndexSnafu { index }.build())
    }

    /// All heaps in index order.
    pub fn heaps(&self) -> &[Heap] {
        &self.heaps
    }

    /// Index of the heap whose regions contain `mem`, if any.
    pub fn index_of(&self, mem: *const u8) -> Option<usize> {
        self.heaps.iter().position(|heap| heap.contains(mem))
    }

    /// The heap whose regions contain `mem`, if any.
    pub fn heap_of(&self, mem: *const u8) -> Option<&Heap> {
        self.heaps.iter().find(|heap| heap.contains(mem))
    }

    /// Allocates from the heap at `index`.
    #[track_caller]
    pub fn malloc_at(&self, index: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap(index)?.malloc(size)
    }

    /// Allocates zeroed bytes from the heap at `index`.
    #[track_caller]
    pub fn zalloc_at(&self, index: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap(index)?.zalloc(size)
    }

    /// Allocates zeroed element storage from the heap at `index`.
    #[track_caller]
    pub fn calloc_at(
        &self,
        index: usize,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.heap(index)?.calloc(count, elem_size)
    }

    /// Allocates aligned storage from the heap at `index`.
    #[track_caller]
    pub fn memalign_at(
        &self,
        index: usize,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.heap(index)?.memalign(alignment, size)
    }

    /// Resizes within the heap at `index`.
    ///
    /// # Safety
    ///
    /// `oldmem` must be null or a live allocation from that heap.
    #[track_caller]
    pub unsafe fn realloc_at(
        &self,
        index: usize,
        oldmem: *mut u8,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe { self.heap(index)?.realloc(oldmem, size) }
    }

    /// Releases `mem` through whichever heap owns it.
    ///
    /// # Panics
    ///
    /// Panics if no heap owns `mem`; releasing a foreign address is
    /// heap corruption.
    ///
    /// # Safety
    ///
    /// `mem` must be a live allocation from one of the heaps.
    pub unsafe fn free(&self, mem: NonNull<u8>) {
        let Some(heap) = self.heap_of(mem.as_ptr()) else {
            panic!("free of address {:#x} not owned by any heap", mem.addr());
        };
        unsafe { heap.free(mem) }
    }

    /// Resizes `oldmem` within whichever heap owns it. A null `oldmem`
    /// allocates from heap 0.
    ///
    /// # Panics
    ///
    /// Panics if `oldmem` is non-null and no heap owns it.
    ///
    /// # Safety
    ///
    /// `oldmem` must be null or a live allocation from one of the
    /// heaps.
    #[track_caller]
    pub unsafe fn realloc(&self, oldmem: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        let heap = if oldmem.is_null() {
            self.heap(0)?
        } else {
            let Some(heap) = self.heap_of(oldmem) else {
                panic!("realloc of address {:#x} not owned by any heap", oldmem.addr());
            };
            heap
        };
        unsafe { heap.realloc(oldmem, size) }
    }
}
