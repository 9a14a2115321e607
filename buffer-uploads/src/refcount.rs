//! [`ReferenceCountingLayer`]: a per-byte-range reference-counted
//! overlay used to track live sub-allocations inside a batched prototype
//! resource, matching `MemoryManagement.{h,cpp}`'s range-splitting scheme.

use buffer_uploads_device::DefragStep;

/// One maximal run of bytes sharing a reference count. Only positive
/// ref counts are stored; a gap between two entries (or before the
/// first / after the last) is an implicit ref count of zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry {
    /// Start offset, inclusive.
    pub start: u32,
    /// End offset, exclusive.
    pub end: u32,
    /// Reference count over `[start, end)`. Always `> 0`.
    pub ref_count: u32,
}

/// Tracks how many live references cover each byte of `[0, size)`.
/// `AddRef`/`Release` split and merge entries so that the structure
/// always holds the minimal set of maximal same-count runs.
#[derive(Clone, Debug)]
pub struct ReferenceCountingLayer {
    size: u32,
    entries: Vec<Entry>,
}

impl ReferenceCountingLayer {
    /// Create a layer over `[0, size)` with no references held anywhere.
    pub fn new(size: u32) -> Self {
        ReferenceCountingLayer {
            size,
            entries: Vec::new(),
        }
    }

    /// Total size of the range being tracked.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of maximal runs currently tracked.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The `index`th run, in ascending start order.
    pub fn entry(&self, index: usize) -> Entry {
        self.entries[index]
    }

    /// Increment the reference count over `[start, end)`, splitting any
    /// overlapping runs at the boundary and creating new runs (at count
    /// 1) over any previously-unreferenced sub-range.
    pub fn add_ref(&mut self, start: u32, end: u32) {
        assert!(start < end && end <= self.size);
        let mut result = Vec::with_capacity(self.entries.len() + 2);
        let mut cursor = start;
        for e in &self.entries {
            if e.end <= start || e.start >= end {
                result.push(*e);
                continue;
            }
            // Gap before this entry, within [start, end): new run at count 1.
            if e.start > cursor {
                result.push(Entry {
                    start: cursor,
                    end: e.start.min(end),
                    ref_count: 1,
                });
            }
            // Leading slice of `e` outside [start, end).
            if e.start < start {
                result.push(Entry {
                    start: e.start,
                    end: start,
                    ref_count: e.ref_count,
                });
            }
            // Overlapping slice: bump the count.
            let overlap_start = e.start.max(start);
            let overlap_end = e.end.min(end);
            result.push(Entry {
                start: overlap_start,
                end: overlap_end,
                ref_count: e.ref_count + 1,
            });
            // Trailing slice of `e` outside [start, end).
            if e.end > end {
                result.push(Entry {
                    start: end,
                    end: e.end,
                    ref_count: e.ref_count,
                });
            }
            cursor = e.end.max(cursor);
        }
        if cursor < end {
            result.push(Entry {
                start: cursor,
                end,
                ref_count: 1,
            });
        }
        result.sort_by_key(|e| e.start);
        self.entries = result;
        self.merge_adjacent();
    }

    /// Decrement the reference count over `[start, end)`. Returns the
    /// sub-ranges that dropped to zero references (i.e. became free),
    /// in ascending order, so the caller can return that space to its
    /// [`crate::heap::SpanningHeap`].
    pub fn release(&mut self, start: u32, end: u32) -> Vec<(u32, u32)> {
        assert!(start < end && end <= self.size);
        let mut result = Vec::with_capacity(self.entries.len() + 1);
        let mut freed = Vec::new();
        for e in &self.entries {
            if e.end <= start || e.start >= end {
                result.push(*e);
                continue;
            }
            if e.start < start {
                result.push(Entry {
                    start: e.start,
                    end: start,
                    ref_count: e.ref_count,
                });
            }
            let overlap_start = e.start.max(start);
            let overlap_end = e.end.min(end);
            debug_assert!(e.ref_count > 0);
            if e.ref_count > 1 {
                result.push(Entry {
                    start: overlap_start,
                    end: overlap_end,
                    ref_count: e.ref_count - 1,
                });
            } else {
                freed.push((overlap_start, overlap_end));
            }
            if e.end > end {
                result.push(Entry {
                    start: end,
                    end: e.end,
                    ref_count: e.ref_count,
                });
            }
        }
        result.sort_by_key(|e| e.start);
        self.entries = result;
        self.merge_adjacent();
        freed
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<Entry> = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.end == e.start && last.ref_count == e.ref_count {
                    last.end = e.end;
                    continue;
                }
            }
            merged.push(e);
        }
        self.entries = merged;
    }

    /// Total bytes covered by at least one reference.
    pub fn calculated_referenced_space(&self) -> u32 {
        self.entries.iter().map(|e| e.end - e.start).sum()
    }

    /// Debug consistency check: entries sorted, non-overlapping,
    /// within bounds, positive ref counts, and no two adjacent entries
    /// sharing a ref count (which should have been merged).
    pub fn validate_block(&self) -> bool {
        let mut prev_end = 0u32;
        let mut prev_ref_count: Option<u32> = None;
        for e in &self.entries {
            if e.start < prev_end || e.end > self.size || e.start >= e.end || e.ref_count == 0 {
                return false;
            }
            if prev_ref_count == Some(e.ref_count) && prev_end == e.start {
                return false;
            }
            prev_end = e.end;
            prev_ref_count = Some(e.ref_count);
        }
        true
    }

    /// Build the layer that results from applying a defrag's `steps` to
    /// this one: every entry whose range was moved is relocated to its
    /// destination offset; entries untouched by any step stay put.
    pub fn perform_defrag(&self, steps: &[DefragStep], new_size: u32) -> ReferenceCountingLayer {
        let mut result = ReferenceCountingLayer::new(new_size);
        for e in &self.entries {
            let shift = steps
                .iter()
                .find(|s| s.source_start <= e.start && e.end <= s.source_end)
                .map(|s| s.destination as i64 - s.source_start as i64)
                .unwrap_or(0);
            result.entries.push(Entry {
                start: (e.start as i64 + shift) as u32,
                end: (e.end as i64 + shift) as u32,
                ref_count: e.ref_count,
            });
        }
        result.entries.sort_by_key(|e| e.start);
        result.merge_adjacent();
        result
    }
}
