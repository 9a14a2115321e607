//! Resource descriptors: the content that gets hashed into pooling keys
//! and handed to [`crate::device::IDevice::create_resource`].

use crate::format::Format;

bitflags::bitflags! {
    /// How a resource will be bound in the pipeline.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER   = 0x1;
        const INDEX_BUFFER    = 0x2;
        const CONSTANT_BUFFER = 0x4;
        const SHADER_RESOURCE = 0x8;
        const RENDER_TARGET   = 0x10;
        const DEPTH_STENCIL   = 0x20;
        const UNORDERED_ACCESS = 0x40;
    }
}

bitflags::bitflags! {
    /// CPU-side access the resource must support.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CpuAccess: u32 {
        const WRITE = 0x1;
        const READ  = 0x2;
    }
}

bitflags::bitflags! {
    /// GPU-side access the resource must support.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct GpuAccess: u32 {
        const READ  = 0x1;
        const WRITE = 0x2;
    }
}

bitflags::bitflags! {
    /// Allocation policy hints consumed by `ResourceSource` (see the
    /// `buffer-uploads` crate). Kept here, next to `ResourceDesc`,
    /// because a desc's allocation rules are part of its pooling
    /// identity.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AllocationRules: u32 {
        /// Serviced by a `ResourcesPool`, reused across transactions.
        const POOLED     = 0x1;
        /// Eligible for `BatchedResources` sub-allocation.
        const BATCHED    = 0x2;
        /// Short-lived, CPU-visible staging resource.
        const STAGING    = 0x4;
        /// Never evicted on age; lives until explicitly released.
        const NON_VOLATILE = 0x8;
    }
}

/// Texture addressing dimensionality.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dimensionality {
    Tex1D,
    Tex2D,
    Tex3D,
    Cube,
}

/// The size and format of a linear buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearBufferDesc {
    pub size_in_bytes: u32,
    /// Structured-buffer element stride; 0 for a raw/typed buffer.
    pub stride: u32,
}

/// The shape and format of a texture.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: Format,
    pub mip_count: u8,
    pub array_count: u16,
    pub samples: u8,
    pub dimensionality: Dimensionality,
}

impl TextureDesc {
    /// Byte size of one (mip, array-layer) subresource, uncompressed
    /// row-major layout with no additional row padding. Real devices
    /// may require a larger, pitch-aligned size; this is the quantity
    /// `CalculatePartialStagingDesc` uses before device-specific pitch
    /// adjustment.
    pub fn subresource_size(&self, mip: u8) -> u32 {
        let w = (self.width >> mip).max(1);
        let h = (self.height >> mip).max(1);
        let d = (self.depth >> mip).max(1);
        if self.format.is_block_compressed() {
            let blocks_w = (w + 3) / 4;
            let blocks_h = (h + 3) / 4;
            blocks_w * blocks_h * d * self.format.block_size()
        } else {
            w * h * d * self.format.bytes_per_texel()
        }
    }

    /// Row pitch of one subresource at the given mip, in bytes.
    pub fn row_pitch(&self, mip: u8) -> u32 {
        let w = (self.width >> mip).max(1);
        if self.format.is_block_compressed() {
            ((w + 3) / 4) * self.format.block_size()
        } else {
            w * self.format.bytes_per_texel()
        }
    }

    /// Total byte size across every mip and array layer.
    pub fn total_size(&self) -> u32 {
        let mut total = 0u32;
        for mip in 0..self.mip_count {
            total += self.subresource_size(mip);
        }
        total * self.array_count.max(1) as u32
    }
}

/// The discriminated union at the heart of the resource model:
/// either a linear buffer or a texture, plus the access/bind metadata
/// that participates in pool hashing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    LinearBuffer(LinearBufferDesc),
    Texture(TextureDesc),
}

/// Full description of a resource to be created or pooled.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
    pub gpu_access: GpuAccess,
    pub allocation_rules: AllocationRules,
    /// Short debug name, truncated the way the original truncated to a
    /// fixed-size buffer; kept as an owned `String` here since Rust has
    /// no reason to replicate the fixed-char-array limitation.
    pub name: String,
}

impl ResourceDesc {
    /// Byte size of the whole resource as the device would allocate it.
    pub fn byte_count(&self) -> u32 {
        match &self.kind {
            ResourceKind::LinearBuffer(b) => b.size_in_bytes,
            ResourceKind::Texture(t) => t.total_size(),
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self.kind, ResourceKind::Texture(_))
    }

    pub fn as_linear_buffer(&self) -> Option<&LinearBufferDesc> {
        match &self.kind {
            ResourceKind::LinearBuffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureDesc> {
        match &self.kind {
            ResourceKind::Texture(t) => Some(t),
            _ => None,
        }
    }
}
