//! Chunk header layout shared by allocated and free chunks.
//!
//! Every chunk in a heap, allocated or free, starts with two machine
//! words: the chunk's own total size and the size of the chunk
//! physically preceding it in memory. The most significant bit of the
//! `preceding` word is repurposed as the allocated flag of the chunk
//! *owning* the header, so a neighbor's free/allocated state can be read
//! during coalescing without any extra tag byte.
//!
//! Free chunks reuse their payload bytes to store forward/backward links
//! into a segregated free list, which sets the minimum chunk size: a
//! chunk must always be large enough to hold [`FreeNode`].
//!
//! # Memory Layout
//!
//! ```text
//! Allocated chunk:                  Free chunk:
//! ┌───────────────────┐            ┌───────────────────┐
//! │ size              │            │ size              │
//! │ preceding | ALLOC │            │ preceding         │
//! ├───────────────────┤            │ flink             │
//! │ payload ...       │            │ blink             │
//! └───────────────────┘            ├───────────────────┤
//!                                  │ unused ...        │
//!                                  └───────────────────┘
//! ```
//!
//! The invariant that makes backward coalescing work: the `preceding`
//! field of a chunk always equals the `size` field of the chunk
//! physically immediately before it.

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Log2 of the allocation granularity (32-byte minimum chunks).
        pub const MIN_SHIFT: usize = 5;
    } else {
        /// Log2 of the allocation granularity (16-byte minimum chunks).
        pub const MIN_SHIFT: usize = 4;
    }
}

/// Log2 of the largest size class. Chunks at or above `1 << MAX_SHIFT`
/// (4 MiB) all land in the final bucket.
pub const MAX_SHIFT: usize = 22;

/// Smallest physical chunk that can exist. Must hold a [`FreeNode`].
pub const MIN_CHUNK: usize = 1 << MIN_SHIFT;

/// Smallest chunk size that maps to the final free-list bucket.
pub const MAX_CHUNK: usize = 1 << MAX_SHIFT;

/// Number of free-list buckets.
pub const NNODES: usize = MAX_SHIFT - MIN_SHIFT + 1;

const GRAN_MASK: usize = MIN_CHUNK - 1;

/// Set in `preceding` when the chunk owning the header is allocated.
pub const ALLOC_BIT: usize = 1 << (usize::BITS - 1);

/// Masks the allocated flag off a `preceding` word.
pub const SIZE_MASK: usize = !ALLOC_BIT;

/// Header of an allocated chunk. Also used for the permanently-allocated
/// region sentinels, which have zero payload.
#[repr(C)]
#[derive(Debug)]
pub struct AllocNode {
    /// Total size of this chunk in bytes, a multiple of [`MIN_CHUNK`].
    pub size: usize,
    /// Size of the physically preceding chunk; the MSB is this chunk's
    /// allocated flag.
    pub preceding: usize,
    /// Source location of the allocating call.
    #[cfg(feature = "heapinfo")]
    pub caller: Option<&'static core::panic::Location<'static>>,
    /// Task that performed the allocation.
    #[cfg(feature = "heapinfo")]
    pub owner: u32,
}

/// Header of a free chunk. The link words overlay what would be payload
/// (and debug fields) in an allocated chunk.
#[repr(C)]
#[derive(Debug)]
pub struct FreeNode {
    /// Total size of this chunk in bytes, a multiple of [`MIN_CHUNK`].
    pub size: usize,
    /// Size of the physically preceding chunk; MSB clear while free.
    pub preceding: usize,
    /// Next free chunk in the same bucket, or null.
    pub flink: *mut FreeNode,
    /// Previous free chunk in the same bucket, or null if this chunk
    /// heads its bucket.
    pub blink: *mut FreeNode,
}

/// Byte overhead of every live allocation.
pub const HEADER_SIZE: usize = size_of::<AllocNode>();

const _: () = assert!(size_of::<FreeNode>() <= MIN_CHUNK);
const _: () = assert!(size_of::<AllocNode>() <= MIN_CHUNK);
const _: () = assert!(MIN_CHUNK.is_multiple_of(align_of::<AllocNode>()));
const _: () = assert!(MIN_CHUNK.is_multiple_of(align_of::<FreeNode>()));
// keeps every payload address a multiple of MIN_CHUNK: the first payload
// of a region sits at two header sizes past its base
const _: () = assert!((2 * HEADER_SIZE).is_multiple_of(MIN_CHUNK));

impl AllocNode {
    pub(crate) const fn new(size: usize, preceding: usize) -> Self {
        Self {
            size,
            preceding,
            #[cfg(feature = "heapinfo")]
            caller: None,
            #[cfg(feature = "heapinfo")]
            owner: 0,
        }
    }
}

/// Whether a header's `preceding` word carries the allocated flag.
///
/// Takes the word rather than a header reference so neighbor checks can
/// read through raw pointers without materializing a reference to a
/// possibly-free chunk.
pub(crate) const fn is_allocated(preceding: usize) -> bool {
    preceding & ALLOC_BIT != 0
}

/// Size of the physically preceding chunk, flag masked off.
pub(crate) const fn preceding_size(preceding: usize) -> usize {
    preceding & SIZE_MASK
}

/// Rounds `size` up to the allocation granularity.
pub(crate) const fn align_up(size: usize) -> usize {
    (size + GRAN_MASK) & !GRAN_MASK
}

/// Rounds `addr` down to the allocation granularity.
pub(crate) const fn align_down(addr: usize) -> usize {
    addr & !GRAN_MASK
}

/// Overflow-checked [`align_up`], for caller-supplied sizes.
pub(crate) const fn checked_align_up(size: usize) -> Option<usize> {
    match size.checked_add(GRAN_MASK) {
        Some(padded) => Some(padded & !GRAN_MASK),
        None => None,
    }
}

/// Maps a chunk size (already rounded up to granularity) to its
/// free-list bucket.
///
/// Bucket `k` covers the half-open size range
/// `[1 << (k + MIN_SHIFT), 1 << (k + 1 + MIN_SHIFT))`; the final bucket
/// absorbs everything at or above [`MAX_CHUNK`]. The mapping is pure bit
/// math (position of the highest set bit), so classification cost does
/// not depend on the size value.
pub(crate) fn size2ndx(size: usize) -> usize {
    debug_assert!(size >= MIN_CHUNK, "size below allocation granularity");
    if size >= MAX_CHUNK {
        return NNODES - 1;
    }
    (usize::BITS - 1 - size.leading_zeros()) as usize - MIN_SHIFT
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_chunk_maps_to_first_bucket() {
        assert_eq!(size2ndx(MIN_CHUNK), 0);
        assert_eq!(size2ndx(2 * MIN_CHUNK - 1), 0);
        assert_eq!(size2ndx(2 * MIN_CHUNK), 1);
    }

    #[test]
    fn test_bucket_ranges_are_power_of_two_spans() {
        for ndx in 0..NNODES - 1 {
            let lo = 1 << (ndx + MIN_SHIFT);
            let hi = (1 << (ndx + 1 + MIN_SHIFT)) - 1;
            assert_eq!(size2ndx(lo), ndx);
            assert_eq!(size2ndx(hi), ndx);
        }
    }

    #[test]
    fn test_largest_bucket_absorbs_everything_above_max() {
        assert_eq!(size2ndx(MAX_CHUNK), NNODES - 1);
        assert_eq!(size2ndx(MAX_CHUNK + 1), NNODES - 1);
        assert_eq!(size2ndx(SIZE_MASK), NNODES - 1);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(1), MIN_CHUNK);
        assert_eq!(align_up(MIN_CHUNK), MIN_CHUNK);
        assert_eq!(align_up(MIN_CHUNK + 1), 2 * MIN_CHUNK);
        assert_eq!(align_down(MIN_CHUNK + 1), MIN_CHUNK);
        assert_eq!(checked_align_up(usize::MAX), None);
        assert_eq!(checked_align_up(17), Some(align_up(17)));
    }

    #[test]
    fn test_alloc_bit_is_msb_of_preceding() {
        let mut node = AllocNode::new(MIN_CHUNK, MIN_CHUNK);
        assert!(!is_allocated(node.preceding));
        node.preceding |= ALLOC_BIT;
        assert!(is_allocated(node.preceding));
        assert_eq!(preceding_size(node.preceding), MIN_CHUNK);
    }
}
