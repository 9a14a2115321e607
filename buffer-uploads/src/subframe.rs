//! [`SubFrameHeap`]: a bump allocator for the many small, short-lived
//! upload payloads a frame produces (skinned-mesh scratch buffers,
//! small constant updates), so each one doesn't cost its own heap
//! allocation.
//!
//! [`SharedPkt`] is a reference-counted view into a sealed heap's
//! backing buffer — lifetime is ordinary `Arc` counting, not a
//! hand-tracked retire-after-N-frames scheme: once every `SharedPkt`
//! into a sealed buffer drops, the buffer frees itself.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

/// An immutable, shareable slice into a [`MiniHeap`]'s sealed contents.
#[derive(Clone, Debug)]
pub struct SharedPkt {
    buffer: Arc<[u8]>,
    range: Range<usize>,
}

impl SharedPkt {
    /// The bytes this packet was sealed with.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.range.clone()]
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// `true` if empty.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl std::ops::Deref for SharedPkt {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A single producer-side bump buffer. Writes accumulate with `push`;
/// `seal` freezes everything pushed so far into shareable [`SharedPkt`]s
/// and resets the heap for the next frame.
struct MiniHeap {
    staging: Vec<u8>,
    capacity: usize,
    pending_ranges: Vec<Range<usize>>,
}

impl MiniHeap {
    fn new(capacity: usize) -> Self {
        MiniHeap {
            staging: Vec::new(),
            capacity,
            pending_ranges: Vec::new(),
        }
    }

    /// Copy `bytes` into the heap. Returns `None` (the caller should
    /// fall back to its own allocation) if this push would exceed the
    /// heap's capacity.
    fn push(&mut self, bytes: &[u8]) -> Option<()> {
        if self.staging.len() + bytes.len() > self.capacity {
            return None;
        }
        let start = self.staging.len();
        self.staging.extend_from_slice(bytes);
        self.pending_ranges.push(start..self.staging.len());
        Some(())
    }

    fn seal(&mut self) -> Vec<SharedPkt> {
        let buffer: Arc<[u8]> = std::mem::take(&mut self.staging).into();
        std::mem::take(&mut self.pending_ranges)
            .into_iter()
            .map(|range| SharedPkt {
                buffer: buffer.clone(),
                range,
            })
            .collect()
    }
}

/// Shared front for one bump-allocated scratch heap. A producer calls
/// [`Self::push`] freely through the frame; the consumer (the worker
/// thread, via `AssemblyLine`) calls [`Self::seal_frame`] once, getting
/// back every packet pushed since the last seal, each independently
/// kept alive by its own `Arc` clone.
pub struct SubFrameHeap {
    heap: Mutex<MiniHeap>,
}

impl SubFrameHeap {
    /// `capacity` bounds how many bytes can be pending between seals.
    pub fn new(capacity: usize) -> Self {
        SubFrameHeap {
            heap: Mutex::new(MiniHeap::new(capacity)),
        }
    }

    /// Push `bytes` in, returning a [`SharedPkt`] once the *next*
    /// `seal_frame` call runs. Returns `None` if the heap is full;
    /// the caller should fall back to an owned allocation in that case.
    pub fn push(&self, bytes: &[u8]) -> Option<()> {
        self.heap.lock().push(bytes)
    }

    /// Seal every packet pushed since the last call, returning a
    /// [`SharedPkt`] for each, in push order, and reset the heap for
    /// the next frame's producers.
    pub fn seal_frame(&self) -> Vec<SharedPkt> {
        self.heap.lock().seal()
    }

    /// Bytes currently pending (pushed, not yet sealed).
    pub fn pending_bytes(&self) -> usize {
        self.heap.lock().staging.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_returns_one_shared_pkt_per_push_in_order() {
        let heap = SubFrameHeap::new(1024);
        heap.push(&[1, 2, 3]).unwrap();
        heap.push(&[4, 5]).unwrap();
        let sealed = heap.seal_frame();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].as_slice(), &[1, 2, 3]);
        assert_eq!(sealed[1].as_slice(), &[4, 5]);
    }

    #[test]
    fn push_past_capacity_returns_none() {
        let heap = SubFrameHeap::new(4);
        assert!(heap.push(&[1, 2, 3]).is_some());
        assert!(heap.push(&[4, 5]).is_none());
    }

    #[test]
    fn sealed_packets_outlive_the_next_frame() {
        let heap = SubFrameHeap::new(1024);
        heap.push(&[9, 9]).unwrap();
        let first_frame = heap.seal_frame();
        heap.push(&[1, 1]).unwrap();
        let _second_frame = heap.seal_frame();
        // first_frame's backing Arc is independent of the second seal.
        assert_eq!(first_frame[0].as_slice(), &[9, 9]);
    }
}
