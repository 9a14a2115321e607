//! [`ResourcesPool`]: reuse of device resources across transactions
//! that share a [`ResourceDesc`].
//!
//! Reads (`create_resource`) and writes (`return_to_pool`) come from
//! different threads at very different rates — the worker thread
//! returns resources constantly, the client thread allocates in
//! bursts — so returns land in a side buffer (`pending_returns`) that
//! never blocks a reader, and get folded into the searchable table by
//! `update`, which the `Manager` calls once per frame. This is the
//! same double-buffered shape the original gave its pool implementation,
//! built here on `parking_lot` instead of a hand-rolled RCU.

use std::collections::HashMap;

use buffer_uploads_device::{ResourceDesc, ResourceHandle, ResourceKind};
use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::Xxh3;

use crate::metrics::PoolMetrics;
use crate::resource_source::round_up_buffer_size;

/// Round a desc's linear buffer size to its pool size class before it
/// ever reaches [`DescHash::of`] or a `create_resource` call. Without
/// this, two requests a few bytes apart (e.g. 1000 vs. 1024) hash to
/// different buckets and never share a pooled resource.
pub fn normalize(desc: &ResourceDesc) -> ResourceDesc {
    let mut desc = desc.clone();
    if let ResourceKind::LinearBuffer(buf) = &mut desc.kind {
        buf.size_in_bytes = round_up_buffer_size(buf.size_in_bytes);
    }
    desc
}

/// A stable hash of a [`ResourceDesc`], used to bucket the pool's
/// search table. Two descs that are `==` always hash equal; collisions
/// are resolved with a direct `==` check, so a bad hash only costs
/// throughput, never correctness.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DescHash(u64);

impl DescHash {
    /// Hash the parts of `desc` that determine pooling identity.
    pub fn of(desc: &ResourceDesc) -> DescHash {
        let mut hasher = Xxh3::new();
        hasher.update(&desc.byte_count().to_le_bytes());
        hasher.update(&[desc.is_texture() as u8]);
        hasher.update(&desc.bind_flags.bits().to_le_bytes());
        hasher.update(&desc.cpu_access.bits().to_le_bytes());
        hasher.update(&desc.gpu_access.bits().to_le_bytes());
        hasher.update(&desc.allocation_rules.bits().to_le_bytes());
        if let Some(t) = desc.as_texture() {
            hasher.update(&t.width.to_le_bytes());
            hasher.update(&t.height.to_le_bytes());
            hasher.update(&t.depth.to_le_bytes());
            hasher.update(&[t.mip_count, t.samples]);
            hasher.update(&t.array_count.to_le_bytes());
        }
        DescHash(hasher.digest())
    }
}

struct Entry<R> {
    resource: R,
    desc: ResourceDesc,
    frames_idle: u32,
}

/// A pool of idle device resources, keyed by [`ResourceDesc`] equality
/// (via [`DescHash`] buckets). Entries idle for more than
/// `retain_frames` consecutive [`Self::update`] calls are dropped.
pub struct ResourcesPool<R: ResourceHandle> {
    search: RwLock<HashMap<DescHash, Vec<Entry<R>>>>,
    pending_returns: Mutex<Vec<(DescHash, Entry<R>)>>,
    retain_frames: u32,
}

impl<R: ResourceHandle> ResourcesPool<R> {
    /// `retain_frames`: how many `update()` calls an idle resource
    /// survives before being dropped.
    pub fn new(retain_frames: u32) -> Self {
        ResourcesPool {
            search: RwLock::new(HashMap::new()),
            pending_returns: Mutex::new(Vec::new()),
            retain_frames,
        }
    }

    /// Take a matching idle resource out of the pool, if one exists.
    /// Does not see resources returned since the last `update()`.
    pub fn create_resource(&self, desc: &ResourceDesc) -> Option<R> {
        let hash = DescHash::of(desc);
        let mut search = self.search.write();
        let bucket = search.get_mut(&hash)?;
        let pos = bucket.iter().position(|e| &e.desc == desc)?;
        Some(bucket.swap_remove(pos).resource)
    }

    /// Hand a resource back to the pool. Visible to `create_resource`
    /// only after the next `update()`.
    pub fn return_to_pool(&self, desc: ResourceDesc, resource: R) {
        let hash = DescHash::of(&desc);
        self.pending_returns.lock().push((
            hash,
            Entry {
                resource,
                desc,
                frames_idle: 0,
            },
        ));
    }

    /// Merge pending returns into the searchable table, age every idle
    /// entry by one frame, and drop entries that aged past
    /// `retain_frames`. Call once per frame.
    pub fn update(&self) {
        let returns = std::mem::take(&mut *self.pending_returns.lock());
        let mut search = self.search.write();
        for (hash, entry) in returns {
            search.entry(hash).or_default().push(entry);
        }
        let retain = self.retain_frames;
        for bucket in search.values_mut() {
            for entry in bucket.iter_mut() {
                entry.frames_idle += 1;
            }
            bucket.retain(|e| e.frames_idle <= retain);
        }
        search.retain(|_, bucket| !bucket.is_empty());
    }

    /// Drop every resource the pool is holding, idle or pending. Used
    /// on device loss, where the handles themselves are no longer valid.
    pub fn on_lost_device(&self) {
        self.search.write().clear();
        self.pending_returns.lock().clear();
    }

    /// Snapshot occupancy for [`crate::manager::Manager::pop_metrics`].
    pub fn metrics(&self) -> PoolMetrics {
        let search = self.search.read();
        let idle_count = search.values().map(|b| b.len() as u32).sum();
        let total_bytes = search
            .values()
            .flat_map(|b| b.iter())
            .map(|e| e.desc.byte_count() as u64)
            .sum();
        PoolMetrics {
            bucket_count: search.len() as u32,
            checked_out_count: 0,
            idle_count,
            total_bytes,
        }
    }
}
