//! Heap memory management for the Oxide RT kernel.
//!
//! This crate implements the kernel's dynamic allocator: boundary-tag
//! chunks threaded through segregated free lists, grouped into heaps
//! that each own up to four disjoint memory regions. It is `no_std`
//! compatible and designed for bare-metal use, with every heap guarded
//! by its own reentrant spin mutex so allocator calls are safe from any
//! task.
//!
//! # Structure
//!
//! - [`Heap`] is one allocator instance: a region table, the free-list
//!   buckets, and a guard. Heaps are `const`-constructible so they can
//!   live in statics and have memory registered at boot.
//! - [`HeapSet`] routes between several independent heaps, by explicit
//!   index for allocation and by address for release.
//! - With the `heapinfo` feature, chunk headers record their allocation
//!   call site and owning task, and heaps keep per-owner byte totals.
//!
//! # Usage
//!
//! ```rust
//! use mm::Heap;
//!
//! let heap = Heap::new();
//! let mut backing = vec![0u8; 4096];
//! unsafe {
//!     heap.initialize(backing.as_mut_ptr(), backing.len()).unwrap();
//! }
//!
//! let mem = heap.malloc(64).unwrap();
//! // ... use the memory ...
//! unsafe {
//!     heap.free(mem);
//! }
//!
//! let stats = heap.stats();
//! assert_eq!(stats.in_use, 0);
//! ```
//!
//! Allocation failure is an ordinary [`AllocError`] value; the heap is
//! never mutated by a failed request. Heap corruption (double free,
//! release of a foreign address, trashed boundary tags) is fatal and
//! panics at the point of detection.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[cfg(any(test, feature = "std"))]
extern crate std;

mod alloc;
mod freelist;
mod heap;
#[cfg(feature = "heapinfo")]
mod heapinfo;
mod lock;
mod multiheap;
mod node;
pub mod task;

pub use crate::{
    alloc::AllocError,
    heap::{ChunkInfo, Heap, HeapStats, MAX_REGIONS, RegionError},
    multiheap::HeapSet,
    node::{HEADER_SIZE, MAX_CHUNK, MIN_CHUNK},
};
#[cfg(feature = "heapinfo")]
pub use crate::heapinfo::{HeapUsage, MAX_OWNERS, OwnerUsage};
