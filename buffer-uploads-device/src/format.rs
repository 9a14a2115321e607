//! Pixel formats used by [`crate::desc::ResourceDesc`].

/// A pixel/texel format.
///
/// This is a small, upload-relevant subset of the format space a real
/// device abstraction would expose (compare `gfx_hal::format::Format`,
/// which enumerates the full Vulkan format table). Buffer Uploads only
/// needs enough information to compute per-texel size and subresource
/// pitches, so unsupported formats are deliberately absent rather than
/// mapped to a stub.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Bc1Unorm,
    Bc3Unorm,
    Bc7Unorm,
    D24UnormS8Uint,
    D32Float,
}

impl Format {
    /// Bytes per texel for uncompressed formats.
    ///
    /// # Panics
    /// Panics if called on a block-compressed format; use
    /// [`Format::block_size`] for those instead.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm => 2,
            Format::Rgba8Unorm | Format::Rgba8Srgb | Format::Bgra8Unorm => 4,
            Format::R16Float => 2,
            Format::Rgba16Float => 8,
            Format::R32Float => 4,
            Format::Rgba32Float => 16,
            Format::D24UnormS8Uint => 4,
            Format::D32Float => 4,
            Format::Bc1Unorm | Format::Bc3Unorm | Format::Bc7Unorm => {
                panic!("block-compressed format has no per-texel size: {:?}", self)
            }
        }
    }

    /// True for block-compressed formats, whose pitch is measured in
    /// 4x4 blocks rather than individual texels.
    pub fn is_block_compressed(self) -> bool {
        matches!(self, Format::Bc1Unorm | Format::Bc3Unorm | Format::Bc7Unorm)
    }

    /// Bytes per 4x4 block, for block-compressed formats.
    pub fn block_size(self) -> u32 {
        match self {
            Format::Bc1Unorm => 8,
            Format::Bc3Unorm | Format::Bc7Unorm => 16,
            _ => panic!("not a block-compressed format: {:?}", self),
        }
    }
}
