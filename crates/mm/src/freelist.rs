//! Segregated free-list maintenance.
//!
//! Free chunks are threaded through an intrusive doubly-linked list per
//! size bucket, using their own payload for the link words. Within a
//! bucket, chunks are kept in ascending size order so that a linear
//! scan returns the smallest chunk that fits.

use crate::{
    heap::HeapData,
    node::{FreeNode, MIN_CHUNK, is_allocated, size2ndx},
};

impl HeapData {
    /// Links `node` into the bucket for its size, keeping the bucket
    /// sorted by ascending size.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid, unlinked free chunk with its size
    /// and boundary tag already written and the allocated bit clear.
    pub(crate) unsafe fn add_free_chunk(&mut self, node: *mut FreeNode) {
        unsafe {
            let size = (*node).size;
            debug_assert!(size >= MIN_CHUNK, "free chunk below minimum size");
            debug_assert!(
                !is_allocated((*node).preceding),
                "allocated bit set on a free chunk"
            );

            let ndx = size2ndx(size);
            let mut prev: *mut FreeNode = core::ptr::null_mut();
            let mut cursor = self.buckets[ndx];
            while !cursor.is_null() && (*cursor).size < size {
                prev = cursor;
                cursor = (*cursor).flink;
            }

            (*node).flink = cursor;
            (*node).blink = prev;
            if !cursor.is_null() {
                (*cursor).blink = node;
            }
            if prev.is_null() {
                self.buckets[ndx] = node;
            } else {
                (*prev).flink = node;
            }
        }
    }

    /// Unlinks `node` from its bucket.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this heap's free-list structure.
    pub(crate) unsafe fn remove_free_chunk(&mut self, node: *mut FreeNode) {
        unsafe {
            let next = (*node).flink;
            let prev = (*node).blink;
            if !next.is_null() {
                (*next).blink = prev;
            }
            if prev.is_null() {
                // head of its bucket; recompute the bucket from the size
                let ndx = size2ndx((*node).size);
                debug_assert_eq!(self.buckets[ndx], node, "free chunk not at its bucket head");
                self.buckets[ndx] = next;
            } else {
                (*prev).flink = next;
            }
        }
    }
}
