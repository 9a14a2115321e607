//! [`BatchedResources`]: packs many small sub-allocations into a few
//! large "prototype" device resources, so a transaction for a 200-byte
//! vertex buffer doesn't cost a full device allocation.
//!
//! Each prototype gets
//! its own [`SpanningHeap`] for offset allocation and
//! [`ReferenceCountingLayer`] so live sub-ranges survive a defrag
//! compaction while in-flight reads against the old layout finish.

use std::sync::{Arc, Weak};

use buffer_uploads_device::{DefragStep, Device, DeviceContext, DeviceError, ResourceDesc};
use parking_lot::Mutex;
use xxhash_rust::xxh3::Xxh3;

use crate::heap::SpanningHeap;
use crate::locator::{ResourceLocator, WeakResourceLocator};
use crate::refcount::ReferenceCountingLayer;

/// Identifies a batching bucket by everything about a [`ResourceDesc`]
/// except its size — two descs that only disagree on `byte_count()`
/// still belong in the same bucket's prototype resources, since the
/// prototype is sized independently via `BufferUploadsConfig`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BucketKey(u64);

impl BucketKey {
    pub fn of(desc: &ResourceDesc) -> BucketKey {
        let mut hasher = Xxh3::new();
        hasher.update(&[desc.is_texture() as u8]);
        hasher.update(&desc.bind_flags.bits().to_le_bytes());
        hasher.update(&desc.cpu_access.bits().to_le_bytes());
        hasher.update(&desc.gpu_access.bits().to_le_bytes());
        hasher.update(&desc.allocation_rules.bits().to_le_bytes());
        BucketKey(hasher.digest())
    }
}

struct HeapedResource<R: buffer_uploads_device::ResourceHandle> {
    resource: R,
    desc: ResourceDesc,
    heap: SpanningHeap,
    refcounts: ReferenceCountingLayer,
    defrag_in_progress: bool,
    /// Every locator currently reading a range of this heap, so a
    /// defrag compaction can rewrite them in place rather than leaving
    /// them pointing at stale coordinates in an evicted resource.
    live_locators: Vec<(u32, u32, WeakResourceLocator<R>)>,
}

/// A planned compaction of one prototype: a replacement resource plus
/// the steps needed to copy live data into it. Produced by
/// [`BatchedResources::begin_defrag`]; the caller is responsible for
/// actually issuing the device-side copy before calling
/// [`BatchedResources::commit_defrag`].
pub struct DefragPlan<R> {
    heap_index: usize,
    new_resource: R,
    new_heap: SpanningHeap,
    new_refcounts: ReferenceCountingLayer,
    /// The copy steps to replay on the device: `source_*` addresses
    /// the old resource, `destination` the new one.
    pub steps: Vec<DefragStep>,
}

/// Owns every prototype resource backing one [`ResourceDesc`]-shaped
/// batching bucket (e.g. "small vertex buffers"). Allocation packs into
/// an existing prototype where it fits; when none do, a new prototype
/// is created from `prototype_desc`.
pub struct BatchedResources<D: Device> {
    prototype_desc: ResourceDesc,
    prototype_size: u32,
    quantum: u32,
    fragmentation_threshold: f32,
    heaps: Mutex<Vec<HeapedResource<D::Resource>>>,
    /// Upgraded by [`Self::make_locator`] so a dropped sub-range's
    /// release hook can call back into this bucket without a plain
    /// `&self` method ever needing to manufacture its own `Arc`.
    self_weak: Weak<Self>,
}

impl<D: Device> BatchedResources<D> {
    /// `prototype_desc` describes the shape of each backing allocation
    /// (its `byte_count()` becomes `prototype_size`); `quantum` is the
    /// sub-allocation granularity; `fragmentation_threshold` is the
    /// fraction of free space (vs. largest free block) past which
    /// [`Self::heap_wants_defrag`] recommends compacting.
    pub fn new(prototype_desc: ResourceDesc, quantum: u32, fragmentation_threshold: f32) -> Arc<Self> {
        let prototype_size = prototype_desc.byte_count();
        Arc::new_cyclic(|weak| BatchedResources {
            prototype_desc,
            prototype_size,
            quantum,
            fragmentation_threshold,
            heaps: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        })
    }

    /// Allocate `size` bytes. Returns `None` if `size` exceeds the
    /// prototype size (the caller should fall back to a direct,
    /// unbatched device resource) or the device fails to create a new
    /// prototype.
    pub fn allocate(&self, device: &D, size: u32) -> Result<Option<ResourceLocator<D::Resource>>, DeviceError> {
        if size > self.prototype_size {
            return Ok(None);
        }
        let mut heaps = self.heaps.lock();
        for (index, h) in heaps.iter_mut().enumerate() {
            if h.defrag_in_progress {
                continue;
            }
            if let Some(offset) = h.heap.allocate(size) {
                h.refcounts.add_ref(offset, offset + size);
                let resource = h.resource.clone();
                let locator = self.make_locator(resource, index, offset, size);
                h.live_locators.push((offset, offset + size, locator.downgrade()));
                return Ok(Some(locator));
            }
        }
        let resource = device.create_resource(&self.prototype_desc, None)?;
        let mut heap = SpanningHeap::new(self.prototype_size, self.quantum);
        let mut refcounts = ReferenceCountingLayer::new(self.prototype_size);
        let offset = heap.allocate(size).expect("fresh prototype must fit a size <= prototype_size");
        refcounts.add_ref(offset, offset + size);
        let index = heaps.len();
        let locator = self.make_locator(resource.clone(), index, offset, size);
        heaps.push(HeapedResource {
            resource,
            desc: self.prototype_desc.clone(),
            heap,
            refcounts,
            defrag_in_progress: false,
            live_locators: vec![(offset, offset + size, locator.downgrade())],
        });
        Ok(Some(locator))
    }

    fn make_locator(
        &self,
        resource: D::Resource,
        heap_index: usize,
        offset: u32,
        size: u32,
    ) -> ResourceLocator<D::Resource> {
        let owner = self
            .self_weak
            .upgrade()
            .expect("BatchedResources handing out a locator must still be alive");
        ResourceLocator::sub_range(
            resource,
            (offset, offset + size),
            Arc::new(move |_res: &D::Resource, range: (u32, u32)| {
                owner.release_range(heap_index, range);
            }),
        )
    }

    fn release_range(&self, heap_index: usize, range: (u32, u32)) {
        let mut heaps = self.heaps.lock();
        let Some(h) = heaps.get_mut(heap_index) else {
            return;
        };
        for (start, end) in h.refcounts.release(range.0, range.1) {
            h.heap.deallocate(start, end - start);
        }
        h.live_locators.retain(|(_, _, weak)| weak.upgrade().is_some());
    }

    /// `true` if the given heap's fragmentation (free space not
    /// reachable as one block) exceeds the configured threshold.
    pub fn heap_wants_defrag(&self, heap_index: usize) -> bool {
        let heaps = self.heaps.lock();
        let Some(h) = heaps.get(heap_index) else {
            return false;
        };
        if h.defrag_in_progress || h.heap.available_space() == 0 {
            return false;
        }
        let fragmented = h.heap.available_space() - h.heap.largest_free_block();
        fragmented as f32 / h.heap.total_size() as f32 > self.fragmentation_threshold
    }

    /// Number of prototype resources currently allocated in this bucket.
    pub fn heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Compute a compaction plan for `heap_index` without touching any
    /// live state. Returns `None` if the heap is already compact, out
    /// of range, or already mid-defrag.
    pub fn begin_defrag(&self, device: &D, heap_index: usize) -> Result<Option<DefragPlan<D::Resource>>, DeviceError> {
        let mut heaps = self.heaps.lock();
        let Some(h) = heaps.get_mut(heap_index) else {
            return Ok(None);
        };
        if h.defrag_in_progress {
            return Ok(None);
        }
        let steps = h.heap.calculate_defrag_steps();
        if steps.is_empty() {
            return Ok(None);
        }
        let new_resource = device.create_resource(&h.desc, None)?;
        let new_heap = h.heap.apply_defrag_steps(&steps);
        let new_refcounts = h.refcounts.perform_defrag(&steps, self.prototype_size);
        h.defrag_in_progress = true;
        Ok(Some(DefragPlan {
            heap_index,
            new_resource,
            new_heap,
            new_refcounts,
            steps,
        }))
    }

    /// Execute a plan's copy steps through `ctx` and, once resolved,
    /// call [`Self::commit_defrag`]. Split out from `begin_defrag` so
    /// the caller controls exactly when the device-side copy is
    /// recorded relative to its own command list bookkeeping.
    pub fn record_defrag_copy(
        &self,
        ctx: &mut D::Context,
        plan: &DefragPlan<D::Resource>,
        old_resource: &D::Resource,
    ) {
        ctx.resource_copy_defrag_steps(&plan.new_resource, old_resource, &plan.steps);
    }

    /// Swap the compacted heap into place after the copy it describes
    /// has been committed to the device, and rewrite every locator
    /// still reading from this heap to point at the new resource and,
    /// for ranges the plan actually moved, their new offset.
    pub fn commit_defrag(&self, plan: DefragPlan<D::Resource>) {
        let mut heaps = self.heaps.lock();
        if let Some(h) = heaps.get_mut(plan.heap_index) {
            let new_resource = plan.new_resource.clone();
            let mut still_live = Vec::with_capacity(h.live_locators.len());
            for (start, end, weak) in h.live_locators.drain(..) {
                let Some(locator) = weak.upgrade() else {
                    continue;
                };
                let moved = plan
                    .steps
                    .iter()
                    .find(|step| step.source_start == start && step.source_end == end);
                let (new_start, new_end) = match moved {
                    Some(step) => (step.destination, step.destination + step.len()),
                    None => (start, end),
                };
                locator.apply_reposition(new_resource.clone(), Some((new_start, new_end)));
                still_live.push((new_start, new_end, weak));
            }
            h.live_locators = still_live;
            h.resource = new_resource;
            h.heap = plan.new_heap;
            h.refcounts = plan.new_refcounts;
            h.defrag_in_progress = false;
        }
    }

    /// Drop every prototype resource. Used on device loss.
    pub fn on_lost_device(&self) {
        self.heaps.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_uploads_device::{LinearBufferDesc, ResourceKind};
    use buffer_uploads_mock::MockDevice;

    fn prototype_desc(size: u32) -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::LinearBuffer(LinearBufferDesc {
                size_in_bytes: size,
                stride: 0,
            }),
            bind_flags: Default::default(),
            cpu_access: Default::default(),
            gpu_access: Default::default(),
            allocation_rules: Default::default(),
            name: "prototype".into(),
        }
    }

    #[test]
    fn bucket_key_ignores_size_but_not_bind_flags() {
        use buffer_uploads_device::BindFlags;
        let a = prototype_desc(1024);
        let mut b = prototype_desc(1 << 20);
        assert_eq!(BucketKey::of(&a), BucketKey::of(&b));
        b.bind_flags = BindFlags::INDEX_BUFFER;
        assert_ne!(BucketKey::of(&a), BucketKey::of(&b));
    }

    #[test]
    fn allocations_pack_into_one_prototype() {
        let device = MockDevice::default();
        let batched = BatchedResources::<MockDevice>::new(prototype_desc(1024), 16, 0.5);
        let a = batched.allocate(&device, 64).unwrap().unwrap();
        let b = batched.allocate(&device, 64).unwrap().unwrap();
        assert_eq!(batched.heap_count(), 1);
        assert_eq!(a.resource(), b.resource());
        assert_ne!(a.range(), b.range());
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let device = MockDevice::default();
        let batched = BatchedResources::<MockDevice>::new(prototype_desc(128), 16, 0.5);
        assert!(batched.allocate(&device, 256).unwrap().is_none());
    }

    #[test]
    fn dropping_locator_frees_space_for_reuse() {
        let device = MockDevice::default();
        let batched = BatchedResources::<MockDevice>::new(prototype_desc(128), 16, 0.5);
        let a = batched.allocate(&device, 128).unwrap().unwrap();
        assert!(batched.allocate(&device, 16).unwrap().is_none());
        drop(a);
        assert!(batched.allocate(&device, 128).unwrap().is_some());
    }

    #[test]
    fn defrag_plan_compacts_and_commits() {
        let device = MockDevice::default();
        let batched = BatchedResources::<MockDevice>::new(prototype_desc(128), 16, 0.0);
        let a = batched.allocate(&device, 32).unwrap().unwrap();
        let _b = batched.allocate(&device, 32).unwrap().unwrap();
        drop(a); // leaves a hole before the survivor
        let plan = batched.begin_defrag(&device, 0).unwrap();
        assert!(plan.is_some());
        let plan = plan.unwrap();
        assert!(!plan.steps.is_empty());
        batched.commit_defrag(plan);
        assert!(!batched.heap_wants_defrag(0));
    }
}
