#![warn(missing_docs)]
//! A tiny in-memory [`buffer_uploads_device::Device`] implementation.
//!
//! This plays the role `gfx-backend-empty` plays in the wider
//! workspace: a reference backend that exists only so the
//! trait surface can be exercised end to end in tests, with no real
//! GPU behind it. Resources are plain heap buffers; "mapping" returns
//! a pointer into that buffer; copies and defrag steps are `memcpy`s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use buffer_uploads_device::{
    DefragStep, Device, DeviceContext, DeviceError, MapMode, MappedRange, PlatformCaps,
    ResourceDesc, StagingToFinalMapping, SubResourceId,
};

/// A resource handle vended by [`MockDevice`]. Cheap to clone: it is a
/// reference-counted pointer to the backing byte buffer.
#[derive(Clone, Debug)]
pub struct MockResource(Arc<MockResourceInner>);

#[derive(Debug)]
struct MockResourceInner {
    id: u64,
    bytes: Mutex<Vec<u8>>,
}

impl MockResource {
    /// Snapshot the current contents, for test assertions.
    pub fn read_back(&self) -> Vec<u8> {
        self.0.bytes.lock().clone()
    }

    /// Stable identity, useful for asserting two locators reference
    /// the same underlying allocation.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Byte length of the backing allocation.
    pub fn len(&self) -> usize {
        self.0.bytes.lock().len()
    }
}

impl PartialEq for MockResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for MockResource {}

/// The mock device itself. Holds every allocated resource alive only
/// through the `Arc` handed back to callers; the device does not keep
/// its own registry: destroying every locator frees the resource.
pub struct MockDevice {
    next_id: AtomicU64,
    caps: PlatformCaps,
}

impl MockDevice {
    /// Construct a mock device. `caps` controls which upload paths the
    /// core engine will choose (inline init, background no-overwrite
    /// map, map-based defrag).
    pub fn new(caps: PlatformCaps) -> Self {
        MockDevice {
            next_id: AtomicU64::new(1),
            caps,
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new(PlatformCaps {
            can_do_no_overwrite_map_in_background: true,
            use_map_based_defrag: true,
            supports_resource_initialisation_buffer: true,
            supports_resource_initialisation_texture: false,
        })
    }
}

impl Device for MockDevice {
    type Resource = MockResource;
    type Context = MockContext;

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        init: Option<&[u8]>,
    ) -> Result<Self::Resource, DeviceError> {
        let size = desc.byte_count() as usize;
        let mut bytes = vec![0u8; size];
        if let Some(init) = init {
            let n = init.len().min(size);
            bytes[..n].copy_from_slice(&init[..n]);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(MockResource(Arc::new(MockResourceInner {
            id,
            bytes: Mutex::new(bytes),
        })))
    }

    fn create_deferred_context(&self) -> Self::Context {
        MockContext::new()
    }

    fn create_immediate_context(&self) -> Self::Context {
        MockContext::new()
    }

    fn platform_caps(&self) -> PlatformCaps {
        self.caps
    }
}

/// An active mapping. Holds the lock on the resource's byte buffer for
/// as long as the map is outstanding.
///
/// # Safety
/// The `'static` lifetime on the stored guard is a lie we maintain by
/// hand: the guard actually borrows from `resource`, which this struct
/// also keeps alive via the `Arc` inside `MockResource`. Since the
/// `Arc` is never dropped before the guard, the borrow stays valid.
struct ActiveMap {
    /// Keeps the backing allocation alive for as long as `guard`
    /// borrows from it; never read otherwise.
    _resource: MockResource,
    guard: MutexGuard<'static, Vec<u8>>,
}

/// A deferred or immediate command-recording context over
/// [`MockResource`]s. Command lists are a formality here: "resolving"
/// just bumps a counter, and "committing" runs the recorded resource
/// copies synchronously since there is no real GPU queue to race with.
pub struct MockContext {
    under_construction: u64,
    committed: u64,
    active_maps: HashMap<(u64, u8, u16), ActiveMap>,
}

impl MockContext {
    fn new() -> Self {
        MockContext {
            under_construction: 1,
            committed: 0,
            active_maps: HashMap::new(),
        }
    }
}

impl DeviceContext for MockContext {
    type Resource = MockResource;

    fn map(
        &mut self,
        resource: &Self::Resource,
        _mode: MapMode,
        subresource: SubResourceId,
    ) -> Result<MappedRange, DeviceError> {
        let key = (resource.id(), subresource.mip, subresource.array_layer);
        let guard: MutexGuard<'_, Vec<u8>> = resource.0.bytes.lock();
        // SAFETY: see `ActiveMap`'s doc comment.
        let guard: MutexGuard<'static, Vec<u8>> = unsafe { std::mem::transmute(guard) };
        let range = {
            let ptr = guard.as_ptr() as *mut u8;
            let size = guard.len();
            MappedRange {
                ptr,
                size,
                row_pitch: size as u32,
                depth_pitch: size as u32,
            }
        };
        self.active_maps.insert(
            key,
            ActiveMap {
                _resource: resource.clone(),
                guard,
            },
        );
        Ok(range)
    }

    fn unmap(&mut self, resource: &Self::Resource, subresource: SubResourceId) {
        let key = (resource.id(), subresource.mip, subresource.array_layer);
        self.active_maps.remove(&key);
    }

    fn resource_copy(&mut self, dst: &Self::Resource, src: &Self::Resource) {
        let src_bytes = src.0.bytes.lock().clone();
        let mut dst_bytes = dst.0.bytes.lock();
        let n = dst_bytes.len().min(src_bytes.len());
        dst_bytes[..n].copy_from_slice(&src_bytes[..n]);
    }

    fn resource_copy_defrag_steps(
        &mut self,
        dst: &Self::Resource,
        src: &Self::Resource,
        steps: &[DefragStep],
    ) {
        let src_bytes = src.0.bytes.lock().clone();
        let mut dst_bytes = dst.0.bytes.lock();
        for step in steps {
            let (s, e, d) = (step.source_start as usize, step.source_end as usize, step.destination as usize);
            let len = e - s;
            dst_bytes[d..d + len].copy_from_slice(&src_bytes[s..e]);
        }
    }

    fn update_final_from_staging(
        &mut self,
        dst: &Self::Resource,
        staging: &Self::Resource,
        mapping: &StagingToFinalMapping,
    ) {
        let staging_bytes = staging.0.bytes.lock().clone();
        let mut dst_bytes = dst.0.bytes.lock();
        for (_sub, staging_offset) in &mapping.subresource_offsets {
            let off = *staging_offset as usize;
            let len = (dst_bytes.len() - off).min(staging_bytes.len().saturating_sub(off));
            if len > 0 {
                dst_bytes[off..off + len].copy_from_slice(&staging_bytes[off..off + len]);
            }
        }
        if mapping.subresource_offsets.is_empty() {
            let n = dst_bytes.len().min(staging_bytes.len());
            dst_bytes[..n].copy_from_slice(&staging_bytes[..n]);
        }
    }

    fn resolve_command_list(&mut self) -> u64 {
        let id = self.under_construction;
        self.under_construction += 1;
        id
    }

    fn commit_to_immediate(&mut self, up_to: u64) {
        self.committed = self.committed.max(up_to);
    }

    fn under_construction(&self) -> u64 {
        self.under_construction
    }

    fn committed_to_immediate(&self) -> u64 {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_uploads_device::{LinearBufferDesc, ResourceKind};

    fn desc(size: u32) -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::LinearBuffer(LinearBufferDesc {
                size_in_bytes: size,
                stride: 0,
            }),
            bind_flags: Default::default(),
            cpu_access: Default::default(),
            gpu_access: Default::default(),
            allocation_rules: Default::default(),
            name: "test".into(),
        }
    }

    #[test]
    fn create_and_copy_roundtrip() {
        let device = MockDevice::default();
        let src = device.create_resource(&desc(16), Some(&[7u8; 16])).unwrap();
        let dst = device.create_resource(&desc(16), None).unwrap();
        let mut ctx = device.create_immediate_context();
        ctx.resource_copy(&dst, &src);
        assert_eq!(dst.read_back(), vec![7u8; 16]);
    }

    #[test]
    fn map_write_unmap_is_visible() {
        let device = MockDevice::default();
        let res = device.create_resource(&desc(8), None).unwrap();
        let mut ctx = device.create_immediate_context();
        {
            let mut mapped = ctx
                .map(&res, MapMode::WriteDiscard, SubResourceId::WHOLE_BUFFER)
                .unwrap();
            unsafe { mapped.as_mut_slice() }.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        ctx.unmap(&res, SubResourceId::WHOLE_BUFFER);
        assert_eq!(res.read_back(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
