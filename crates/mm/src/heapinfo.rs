//! Optional allocation accounting.
//!
//! With the `heapinfo` feature enabled, every chunk header records the
//! call site and owning task of its allocation, and each heap keeps
//! running per-heap and per-owner byte totals with peak watermarks.
//! Task stacks carved out of a heap can be excluded from their owner's
//! total so the figure reflects true heap consumption.

use arrayvec::ArrayVec;

use crate::node::AllocNode;

/// Maximum number of distinct owners tracked per heap. Allocations by
/// further owners still count toward the heap totals.
pub const MAX_OWNERS: usize = 16;

/// Byte totals for one owning task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerUsage {
    pub owner: u32,
    /// Bytes currently allocated, headers included.
    pub current: usize,
    /// High watermark of `current`.
    pub peak: usize,
    /// Bytes marked as stack memory, excluded from heap figures.
    pub stack: usize,
}

impl OwnerUsage {
    /// Heap bytes attributable to this owner, stack storage excluded.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.current.saturating_sub(self.stack)
    }
}

/// Running usage totals for one heap.
#[derive(Debug, Clone, Default)]
pub struct HeapUsage {
    /// Bytes currently allocated across the heap, headers included.
    pub current: usize,
    /// High watermark of `current`.
    pub peak: usize,
    owners: ArrayVec<OwnerUsage, MAX_OWNERS>,
}

impl HeapUsage {
    pub(crate) const fn new() -> Self {
        Self {
            current: 0,
            peak: 0,
            owners: ArrayVec::new_const(),
        }
    }

    /// Per-owner totals, in first-seen order.
    pub fn owners(&self) -> &[OwnerUsage] {
        &self.owners
    }

    /// Totals for one owner, if it has allocated here.
    pub fn owner(&self, owner: u32) -> Option<&OwnerUsage> {
        self.owners.iter().find(|entry| entry.owner == owner)
    }

    fn entry(&mut self, owner: u32) -> Option<&mut OwnerUsage> {
        if let Some(pos) = self.owners.iter().position(|entry| entry.owner == owner) {
            return Some(&mut self.owners[pos]);
        }
        self.owners
            .try_push(OwnerUsage {
                owner,
                ..OwnerUsage::default()
            })
            .ok()?;
        self.owners.last_mut()
    }

    pub(crate) fn on_alloc(&mut self, size: usize, owner: u32) {
        self.current += size;
        self.peak = self.peak.max(self.current);
        if let Some(entry) = self.entry(owner) {
            entry.current += size;
            entry.peak = entry.peak.max(entry.current);
        }
    }

    pub(crate) fn on_free(&mut self, size: usize, owner: u32) {
        self.current = self.current.saturating_sub(size);
        if let Some(entry) = self.owners.iter_mut().find(|entry| entry.owner == owner) {
            entry.current = entry.current.saturating_sub(size);
        }
    }

    pub(crate) fn exclude_stack(&mut self, size: usize, owner: u32) {
        if let Some(entry) = self.entry(owner) {
            entry.stack += size;
        }
    }
}

/// Records the allocation's call site and owner in the chunk header.
///
/// # Safety
///
/// `node` must point to a valid allocated chunk header.
pub(crate) unsafe fn stamp(
    node: *mut AllocNode,
    caller: &'static core::panic::Location<'static>,
    owner: u32,
) {
    unsafe {
        (*node).caller = Some(caller);
        (*node).owner = owner;
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_totals_and_watermarks() {
        let mut usage = HeapUsage::new();
        usage.on_alloc(128, 3);
        usage.on_alloc(64, 3);
        usage.on_alloc(32, 7);
        assert_eq!(usage.current, 224);
        assert_eq!(usage.peak, 224);
        assert_eq!(usage.owner(3).unwrap().current, 192);

        usage.on_free(64, 3);
        assert_eq!(usage.current, 160);
        assert_eq!(usage.peak, 224);
        assert_eq!(usage.owner(3).unwrap().current, 128);
        assert_eq!(usage.owner(3).unwrap().peak, 192);
    }

    #[test]
    fn test_stack_bytes_are_excluded() {
        let mut usage = HeapUsage::new();
        usage.on_alloc(4096, 1);
        usage.exclude_stack(4096, 1);
        assert_eq!(usage.owner(1).unwrap().heap_bytes(), 0);
        assert_eq!(usage.current, 4096);
    }

    #[test]
    fn test_owner_table_overflow_still_counts_heap_totals() {
        let mut usage = HeapUsage::new();
        for owner in 0..(MAX_OWNERS as u32 + 4) {
            usage.on_alloc(16, owner);
        }
        assert_eq!(usage.current, 16 * (MAX_OWNERS + 4));
        assert_eq!(usage.owners().len(), MAX_OWNERS);
    }
}
