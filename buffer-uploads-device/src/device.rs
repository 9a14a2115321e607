//! The trait boundary between the transfer engine and the underlying
//! graphics API. A real backend (D3D12, Vulkan, Metal...) is a
//! collaborator outside this workspace's scope; what lives here is
//! only the shape of the contract `buffer-uploads`
//! consumes, mirroring how `gfx-hal`'s `Device`/`CommandBuffer` traits
//! describe a contract that `gfx-backend-*` crates fulfill elsewhere.

use std::fmt;

use crate::desc::ResourceDesc;
use crate::error::DeviceError;

/// Identifies one (mip level, array layer) subresource of a texture,
/// or the single implicit subresource of a linear buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SubResourceId {
    pub mip: u8,
    pub array_layer: u16,
}

impl SubResourceId {
    pub const WHOLE_BUFFER: Self = SubResourceId {
        mip: 0,
        array_layer: 0,
    };
}

/// How a mapped range of a resource will be used by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapMode {
    /// The caller will only write; prior contents are undefined.
    WriteDiscard,
    /// The caller will write without invalidating unrelated regions
    /// (no-overwrite map); required for background staging writes.
    WriteNoOverwrite,
    Read,
}

/// A CPU-visible view onto a mapped resource range, handed back by
/// [`DeviceContext::map`]. The pointer is valid until the matching
/// [`DeviceContext::unmap`] call.
pub struct MappedRange {
    pub ptr: *mut u8,
    pub size: usize,
    /// Row pitch for texture subresources; equal to `size` for buffers.
    pub row_pitch: u32,
    /// Depth pitch (bytes per depth slice); equal to `row_pitch` times
    /// height for 2D textures, unused for buffers.
    pub depth_pitch: u32,
}

// SAFETY: the pointer is only ever read back through `as_mut_slice`,
// which the caller must not do concurrently with another thread doing
// the same — the same discipline a raw `Map`/`Unmap` pair requires in
// any graphics API.
unsafe impl Send for MappedRange {}

impl MappedRange {
    /// # Safety
    /// The caller must ensure no other code is concurrently reading or
    /// writing this range, and that it does not outlive the matching
    /// `unmap` call.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size)
    }
}

/// One step of a defragmentation move: bytes in `[source_start,
/// source_end)` of the old resource now live at `destination` in the
/// new one. Shared between `buffer-uploads`'s `SpanningHeap` (which
/// produces these) and the device boundary (whose `copy_defrag_steps`
/// consumes them), so it lives in the device-facing crate as plain
/// data with no pooling logic attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DefragStep {
    pub source_start: u32,
    pub source_end: u32,
    pub destination: u32,
}

impl DefragStep {
    pub fn len(&self) -> u32 {
        self.source_end - self.source_start
    }

    pub fn is_empty(&self) -> bool {
        self.source_start == self.source_end
    }
}

/// Per-subresource offset/pitch mapping recorded by the staging path,
/// so `TransferStagingToFinalStep` knows where each subresource landed
/// inside the staging resource.
#[derive(Clone, Debug, Default)]
pub struct StagingToFinalMapping {
    pub mip_base: u8,
    pub array_base: u16,
    pub subresource_offsets: Vec<(SubResourceId, u32)>,
}

/// A resource created and owned by the device, identified by a
/// backend-specific handle. `buffer-uploads` never inspects the
/// handle's contents; it only clones, compares, and hands it back to
/// the device.
pub trait ResourceHandle: Clone + fmt::Debug + Send + Sync + 'static {}
impl<T: Clone + fmt::Debug + Send + Sync + 'static> ResourceHandle for T {}

/// A monotonically increasing identifier for a resolved/submitted
/// command list, as exposed to clients through `ResourceLocator`'s
/// `completion_command_list` and `Manager::is_complete`.
pub type CommandListId = u64;

/// Capability bits the core queries once at startup, rather than as
/// build-time constants or repeated dynamic queries. Centralizing them
/// in one struct avoids re-querying a device vtable on every decision
/// point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlatformCaps {
    pub can_do_no_overwrite_map_in_background: bool,
    pub use_map_based_defrag: bool,
    pub supports_resource_initialisation_buffer: bool,
    pub supports_resource_initialisation_texture: bool,
}

/// A deferred or immediate command-recording context. Deferred
/// contexts build a command list that is later executed on the
/// immediate context; the immediate context executes directly.
pub trait DeviceContext: Send {
    type Resource: ResourceHandle;

    /// Map a subresource range for CPU access.
    fn map(
        &mut self,
        resource: &Self::Resource,
        mode: MapMode,
        subresource: SubResourceId,
    ) -> Result<MappedRange, DeviceError>;

    /// Release a previously mapped range.
    fn unmap(&mut self, resource: &Self::Resource, subresource: SubResourceId);

    /// Copy the entire contents of `src` into `dst`.
    fn resource_copy(&mut self, dst: &Self::Resource, src: &Self::Resource);

    /// Apply a set of defragmentation moves, copying each source range
    /// of `src` to its destination offset in `dst`.
    fn resource_copy_defrag_steps(
        &mut self,
        dst: &Self::Resource,
        src: &Self::Resource,
        steps: &[DefragStep],
    );

    /// Update `dst` from a staging resource using a recorded mapping,
    /// e.g. after `PrepareData` has filled the staging maps.
    fn update_final_from_staging(
        &mut self,
        dst: &Self::Resource,
        staging: &Self::Resource,
        mapping: &StagingToFinalMapping,
    );

    /// Resolve the command list under construction: it becomes
    /// queued-for-submission and a fresh one begins. Returns the id of
    /// the list that was just resolved.
    fn resolve_command_list(&mut self) -> CommandListId;

    /// Execute every command list resolved on this context, up to and
    /// including `up_to`, on the immediate device context.
    fn commit_to_immediate(&mut self, up_to: CommandListId);

    /// The id of the command list currently under construction.
    fn under_construction(&self) -> CommandListId;

    /// The id of the highest command list submitted to the immediate
    /// context so far.
    fn committed_to_immediate(&self) -> CommandListId;
}

/// The device itself: creates resources and vends command-recording
/// contexts. Analogous to `gfx_hal::Device` plus
/// `gfx_hal::Adapter::open`'s role of handing out queues/contexts.
pub trait Device: Send + Sync {
    type Resource: ResourceHandle;
    type Context: DeviceContext<Resource = Self::Resource>;

    /// Create a resource matching `desc`. If `init` is provided and
    /// the platform supports resource-initialization-at-create for
    /// this resource kind (see [`PlatformCaps`]), the bytes are
    /// uploaded as part of creation; otherwise `init` is ignored and
    /// the caller must transfer via staging afterward.
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        init: Option<&[u8]>,
    ) -> Result<Self::Resource, DeviceError>;

    /// Construct a new deferred command-recording context.
    fn create_deferred_context(&self) -> Self::Context;

    /// Construct the immediate (submission) context.
    fn create_immediate_context(&self) -> Self::Context;

    /// Capability bits queried once at startup.
    fn platform_caps(&self) -> PlatformCaps;

    /// Recalculate and report available video memory headroom; a
    /// no-op for devices that do not track this.
    fn recalculate_video_memory_headroom(&self) {}
}
