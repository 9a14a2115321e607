//! Metrics snapshots handed back to clients by [`crate::manager::Manager::pop_metrics`]
//! matching the counters `Metrics.h` tracks.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What kind of data a transaction's command list was moving, for
/// metrics breakdowns.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UploadDataType {
    /// Texture data (subresource-addressed).
    Texture,
    /// Vertex buffer data.
    Vertex,
    /// Index buffer data.
    Index,
}

impl UploadDataType {
    /// Every variant, in a stable order matching the fixed-size
    /// breakdown arrays below.
    pub const ALL: [UploadDataType; 3] = [
        UploadDataType::Texture,
        UploadDataType::Vertex,
        UploadDataType::Index,
    ];
}

/// A per-[`UploadDataType`] breakdown, indexed by [`UploadDataType::ALL`]'s order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ByUploadType<T> {
    /// Values for `UploadDataType::Texture`, `Vertex`, `Index` respectively.
    pub values: [T; 3],
}

impl<T: Copy + Default> ByUploadType<T> {
    /// Look up the value for a given upload type.
    pub fn get(&self, kind: UploadDataType) -> T {
        self.values[kind as usize]
    }

    /// Mutably look up the value for a given upload type.
    pub fn get_mut(&mut self, kind: UploadDataType) -> &mut T {
        &mut self.values[kind as usize]
    }
}

/// A single retired transaction's contribution to a [`CommandListMetrics`]
/// snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AssemblyLineRetirement {
    /// Bytes transferred by this transaction.
    pub bytes_uploaded: u64,
    /// What kind of data it was.
    pub data_type: Option<UploadDataTypeTag>,
}

/// Stand-in for [`UploadDataType`] that is representable as a fixed
/// default (so `AssemblyLineRetirement` can derive `Default`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UploadDataTypeTag(pub UploadDataType);

/// Aggregate metrics for one resolved command list. The original kept
/// a small fixed-size inline array of retirements plus an overflow
/// vector to avoid allocating in the common case; we keep that shape
/// since `PopMetrics` is called every frame and is expected not to
/// allocate on the hot path when retirement counts are small.
#[derive(Clone, Debug, Default)]
pub struct CommandListMetrics {
    retirements_inline: [AssemblyLineRetirement; 16],
    retirements_inline_count: usize,
    retirements_overflow: Vec<AssemblyLineRetirement>,
    /// Total bytes uploaded across every retirement in this command list.
    pub bytes_uploaded_total: u64,
    /// Wall-clock microseconds spent servicing this command list, if tracked.
    pub device_create_operations: u32,
}

impl CommandListMetrics {
    /// Record a transaction's retirement, spilling to the overflow
    /// vector once the inline array is full.
    pub fn push_retirement(&mut self, retirement: AssemblyLineRetirement) {
        self.bytes_uploaded_total += retirement.bytes_uploaded;
        if self.retirements_inline_count < self.retirements_inline.len() {
            self.retirements_inline[self.retirements_inline_count] = retirement;
            self.retirements_inline_count += 1;
        } else {
            self.retirements_overflow.push(retirement);
        }
    }

    /// Number of retirements recorded.
    pub fn retirement_count(&self) -> usize {
        self.retirements_inline_count + self.retirements_overflow.len()
    }

    /// The retirement at `index`, panicking if out of range.
    pub fn retirement(&self, index: usize) -> AssemblyLineRetirement {
        if index < self.retirements_inline_count {
            self.retirements_inline[index]
        } else {
            self.retirements_overflow[index - self.retirements_inline_count]
        }
    }
}

/// Snapshot of the assembly line's worker-thread activity since the
/// last `PopMetrics` call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AssemblyLineMetrics {
    /// Transactions currently occupying the temporary table.
    pub transaction_count: u32,
    /// Transactions currently occupying the long-term table.
    pub long_term_transaction_count: u32,
    /// Bytes queued across every step queue-set, awaiting the worker thread.
    pub queued_bytes: u64,
    /// Steps dropped since the last snapshot because a queue-set was full.
    pub steps_dropped: u32,
}

/// Snapshot of a [`crate::pool::ResourcesPool`]'s occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolMetrics {
    /// Distinct `ResourceDesc` buckets currently tracked.
    pub bucket_count: u32,
    /// Resources currently checked out to clients.
    pub checked_out_count: u32,
    /// Resources sitting idle, available for reuse.
    pub idle_count: u32,
    /// Total bytes held across idle and checked-out resources.
    pub total_bytes: u64,
}

/// Snapshot of a `BatchedResources` heap's fragmentation state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchedHeapMetrics {
    /// Bytes currently allocated out of the backing prototype resource.
    pub allocated_space: u64,
    /// Bytes still free in the backing prototype resource.
    pub available_space: u64,
    /// Size of the single largest free block.
    pub largest_free_block: u64,
    /// `true` if a defrag pass is currently in flight.
    pub defrag_in_progress: bool,
}

/// Aggregate metrics across every `BatchedResources` heap in a pool.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchingSystemMetrics {
    /// One entry per active heap.
    pub heaps: Vec<BatchedHeapMetrics>,
}

/// Top-level metrics returned by [`crate::manager::Manager::pop_metrics`].
#[derive(Clone, Debug, Default)]
pub struct PoolSystemMetrics {
    /// Worker thread / transaction table activity.
    pub assembly_line: AssemblyLineMetrics,
    /// Per-recently-resolved-command-list breakdown.
    pub command_lists: Vec<CommandListMetrics>,
    /// Per-`ResourceDesc`-bucket pool occupancy.
    pub pools: Vec<PoolMetrics>,
    /// Batched small-resource allocator state.
    pub batching: BatchingSystemMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_list_metrics_spills_to_overflow_past_sixteen() {
        let mut metrics = CommandListMetrics::default();
        for i in 0..20 {
            metrics.push_retirement(AssemblyLineRetirement {
                bytes_uploaded: i,
                data_type: Some(UploadDataTypeTag(UploadDataType::Vertex)),
            });
        }
        assert_eq!(metrics.retirement_count(), 20);
        assert_eq!(metrics.bytes_uploaded_total, (0..20).sum());
        assert_eq!(metrics.retirement(0).bytes_uploaded, 0);
        assert_eq!(metrics.retirement(19).bytes_uploaded, 19);
    }

    #[test]
    fn by_upload_type_indexes_in_all_order() {
        let mut counts: ByUploadType<u32> = ByUploadType::default();
        *counts.get_mut(UploadDataType::Index) += 1;
        assert_eq!(counts.get(UploadDataType::Texture), 0);
        assert_eq!(counts.get(UploadDataType::Index), 1);
    }
}
