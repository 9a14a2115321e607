//! Routing policy: decide how a given [`ResourceDesc`] should be
//! serviced — a fresh device allocation, a pooled resource, or a
//! sub-range of a batched prototype, matching `ResourceSource.cpp`'s
//! `UsePooling`/`RoundUpBufferSize` policy.

use buffer_uploads_device::{AllocationRules, BindFlags, ResourceDesc, ResourceKind};

/// Below this size, a linear buffer is eligible for pooling rather
/// than a dedicated device allocation. Matches the original's
/// `_sizeInBytes < (32*1024)` threshold exactly, including its
/// strictness (32 KiB itself does not qualify).
pub const POOLING_SIZE_THRESHOLD: u32 = 32 * 1024;

/// How a resource request should be serviced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoutingDecision {
    /// Small enough, and not excluded by its bind flags: try the
    /// `ResourcesPool` first, falling back to a direct allocation.
    Pooled,
    /// Small enough *and* an index buffer (or explicitly marked
    /// `BATCHED`): try `BatchedResources` first, falling back to pooled,
    /// falling back to direct.
    PooledAndBatched,
    /// Bypasses pooling: go straight to the device.
    Direct,
}

/// Decide how `desc` should be routed. Textures are never pooled or
/// batched in the original system (only linear buffers are), so they
/// always route `Direct`.
pub fn route(desc: &ResourceDesc) -> RoutingDecision {
    if desc.allocation_rules.contains(AllocationRules::STAGING) {
        return RoutingDecision::Direct;
    }
    let ResourceKind::LinearBuffer(buf) = &desc.kind else {
        return RoutingDecision::Direct;
    };
    if !should_pool(buf.size_in_bytes, desc.allocation_rules) {
        return RoutingDecision::Direct;
    }
    if desc.allocation_rules.contains(AllocationRules::BATCHED)
        || desc.bind_flags.contains(BindFlags::INDEX_BUFFER)
    {
        RoutingDecision::PooledAndBatched
    } else {
        RoutingDecision::Pooled
    }
}

fn should_pool(size_in_bytes: u32, rules: AllocationRules) -> bool {
    if rules.contains(AllocationRules::NON_VOLATILE) {
        return false;
    }
    rules.contains(AllocationRules::POOLED) && size_in_bytes < POOLING_SIZE_THRESHOLD
}

/// Round a linear buffer size up to the nearest pool-friendly size
/// class, so that small variations in requested size (e.g. 1000 bytes
/// vs. 1024) still land in the same pool bucket and get reused. Mirrors
/// the original's two-tier doubling: below 4 KiB, round to the next
/// power of two; from 4 KiB up to 16 KiB, round to the next multiple of
/// 4 KiB; at or above 16 KiB, round to the next multiple of 16 KiB.
pub fn round_up_buffer_size(size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    let log2 = 32 - (size - 1).leading_zeros();
    if log2 < 12 {
        1 << log2
    } else if log2 < 14 {
        (size + 0xFFF) & !0xFFF
    } else {
        (size + 0x3FFF) & !0x3FFF
    }
}
