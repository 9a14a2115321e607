//! [`SpanningHeap`]: a first-fit offset/size allocator over a fixed
//! byte range.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::Xxh3;

use crate::error::HeapError;
use buffer_uploads_device::DefragStep;

/// An offset/size allocator over `[0, size)`. Live allocations are the
/// source of truth (kept as a sorted map of `start -> size`); free
/// space is always the complement, so a `deallocate` call merges with
/// its neighbours for free — there is no separate free-list to keep in
/// sync.
#[derive(Clone, Debug)]
pub struct SpanningHeap {
    quantum: u32,
    total_size: u32,
    // start -> size, both already quantum-aligned.
    allocations: BTreeMap<u32, u32>,
}

impl SpanningHeap {
    /// Create a heap managing `[0, size)`, with every offset and
    /// allocation size rounded up to `quantum` bytes.
    pub fn new(size: u32, quantum: u32) -> Self {
        assert!(quantum >= 1);
        SpanningHeap {
            quantum,
            total_size: Self::align(quantum, size),
            allocations: BTreeMap::new(),
        }
    }

    fn align(quantum: u32, size: u32) -> u32 {
        let q = quantum.max(1);
        ((size + q - 1) / q) * q
    }

    /// Allocate `size` bytes, first-fit. Returns `None` if no gap (and
    /// no trailing space) is large enough.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        assert!(size >= 1, "allocation size must be >= 1");
        let aligned = Self::align(self.quantum, size);
        let mut cursor = 0u32;
        for (&start, &len) in self.allocations.iter() {
            if start.saturating_sub(cursor) >= aligned {
                self.allocations.insert(cursor, aligned);
                return Some(cursor);
            }
            cursor = cursor.max(start + len);
        }
        if self.total_size.saturating_sub(cursor) >= aligned {
            self.allocations.insert(cursor, aligned);
            return Some(cursor);
        }
        None
    }

    /// Like [`Self::allocate`] but reports [`HeapError::HeapExhausted`]
    /// instead of growing or returning `None`.
    pub fn try_allocate(&mut self, size: u32) -> Result<u32, HeapError> {
        self.allocate(size).ok_or(HeapError::HeapExhausted)
    }

    /// Grow the heap by `size` bytes (rounded up to the quantum).
    pub fn append_new_block(&mut self, size: u32) {
        self.total_size += Self::align(self.quantum, size);
    }

    /// Release the allocation at `offset`. `size` must match the size
    /// passed to the matching `allocate` call (debug-asserted).
    pub fn deallocate(&mut self, offset: u32, size: u32) {
        let aligned = Self::align(self.quantum, size);
        let removed = self.allocations.remove(&offset);
        debug_assert_eq!(
            removed,
            Some(aligned),
            "deallocate size mismatch at offset {offset}"
        );
    }

    /// Total heap size, including allocated and free space.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Sum of all live allocation sizes.
    pub fn allocated_space(&self) -> u32 {
        self.allocations.values().sum()
    }

    /// `total_size - allocated_space`.
    pub fn available_space(&self) -> u32 {
        self.total_size - self.allocated_space()
    }

    /// Size of the single largest contiguous free gap.
    pub fn largest_free_block(&self) -> u32 {
        let mut cursor = 0u32;
        let mut largest = 0u32;
        for (&start, &len) in self.allocations.iter() {
            largest = largest.max(start.saturating_sub(cursor));
            cursor = cursor.max(start + len);
        }
        largest.max(self.total_size.saturating_sub(cursor))
    }

    /// True if the heap has no live allocations.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// A stable content hash, used to suppress repeated defragging of
    /// an unchanged heap.
    pub fn calculate_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for (&start, &len) in self.allocations.iter() {
            hasher.update(&start.to_le_bytes());
            hasher.update(&len.to_le_bytes());
        }
        hasher.digest()
    }

    /// Compute the minimal set of moves that compacts every live
    /// allocation to the front of the heap, preserving relative order.
    /// Returns an empty vector if the heap is already compact.
    pub fn calculate_defrag_steps(&self) -> Vec<DefragStep> {
        let mut steps = Vec::new();
        let mut dest_cursor = 0u32;
        for (&start, &len) in self.allocations.iter() {
            if start != dest_cursor {
                steps.push(DefragStep {
                    source_start: start,
                    source_end: start + len,
                    destination: dest_cursor,
                });
            }
            dest_cursor += len;
        }
        steps
    }

    /// Build the heap that results from applying `steps` (as produced
    /// by [`Self::calculate_defrag_steps`]) to this one. Used by
    /// `BatchedResources` to construct the replacement heap for a
    /// defrag before the copy has actually executed on the device.
    pub fn apply_defrag_steps(&self, steps: &[DefragStep]) -> SpanningHeap {
        let mut result = SpanningHeap::new(self.total_size, self.quantum);
        let moved: BTreeMap<u32, &DefragStep> =
            steps.iter().map(|s| (s.source_start, s)).collect();
        for (&start, &len) in self.allocations.iter() {
            let dest = moved
                .get(&start)
                .map(|s| s.destination)
                .unwrap_or(start);
            result.allocations.insert(dest, len);
        }
        result
    }

    /// The quantum allocations and offsets are aligned to.
    pub fn quantum(&self) -> u32 {
        self.quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_first_fit_and_available_space() {
        let mut heap = SpanningHeap::new(1024, 16);
        let a = heap.allocate(100).unwrap();
        assert_eq!(a, 0);
        let b = heap.allocate(200).unwrap();
        assert_eq!(b, 112); // 100 rounded up to 112 (16-byte quantum)
        assert_eq!(heap.allocated_space(), 112 + 208);
        assert_eq!(heap.available_space(), 1024 - 112 - 208);
    }

    #[test]
    fn deallocate_merges_with_neighbours() {
        let mut heap = SpanningHeap::new(256, 16);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _c = heap.allocate(64).unwrap();
        heap.deallocate(a, 64);
        heap.deallocate(b, 64);
        assert_eq!(heap.largest_free_block(), 128);
    }

    #[test]
    fn exhaustion_without_grow() {
        let mut heap = SpanningHeap::new(64, 16);
        assert!(heap.allocate(64).is_some());
        assert_eq!(heap.try_allocate(16), Err(HeapError::HeapExhausted));
    }

    #[test]
    fn defrag_compacts_to_front_and_largest_free_block_is_available_space() {
        let mut heap = SpanningHeap::new(256, 16);
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        let c = heap.allocate(32).unwrap();
        heap.deallocate(b, 32);
        let steps = heap.calculate_defrag_steps();
        assert!(!steps.is_empty());
        let compacted = heap.apply_defrag_steps(&steps);
        assert_eq!(compacted.allocated_space(), 64);
        assert_eq!(compacted.largest_free_block(), compacted.available_space());

        // original positions are untouched by computing steps
        assert_eq!(a, 0);
        assert_eq!(c, 64);
    }

    #[test]
    fn already_compact_heap_has_no_defrag_steps() {
        let mut heap = SpanningHeap::new(128, 16);
        heap.allocate(32).unwrap();
        heap.allocate(32).unwrap();
        assert!(heap.calculate_defrag_steps().is_empty());
    }

    #[test]
    fn append_new_block_grows_total_size() {
        let mut heap = SpanningHeap::new(16, 16);
        heap.allocate(16).unwrap();
        assert!(heap.allocate(16).is_none());
        heap.append_new_block(16);
        assert!(heap.allocate(16).is_some());
    }
}
