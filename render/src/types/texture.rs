//! Texture types and descriptors.

use bitflags::bitflags;

/// Texel formats understood by the device core.
///
/// Only what is needed to describe resource identity and byte sizes; the
/// full format zoo lives with the concrete backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit RGBA, normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA, unsigned integer.
    Rgba8Uint,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// 32-bit float, single channel.
    R32Float,
    /// 32-bit unsigned integer, single channel.
    R32Uint,
}

impl TextureFormat {
    /// Size of one texel in bytes.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Uint => 4,
            Self::Rgba32Float => 16,
            Self::R32Float | Self::R32Uint => 4,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be sampled in a dispatch.
        const SAMPLED = 1 << 0;
        /// Texture can be written as storage in a dispatch.
        const STORAGE = 1 << 1;
        /// Texture can be copied from.
        const COPY_SRC = 1 << 2;
        /// Texture can be copied to.
        const COPY_DST = 1 << 3;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Texel format.
    pub format: TextureFormat,
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Array slices.
    pub array_slices: u32,
    /// Mip levels.
    pub mip_levels: u32,
    /// Usage flags.
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            format: TextureFormat::default(),
            width: 1,
            height: 1,
            array_slices: 1,
            mip_levels: 1,
            usage: TextureUsage::default(),
        }
    }
}

impl TextureDescriptor {
    /// Create a 2D texture descriptor with one mip and one slice.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            format,
            width,
            height,
            array_slices: 1,
            mip_levels: 1,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the array slice count.
    pub fn with_array_slices(mut self, array_slices: u32) -> Self {
        self.array_slices = array_slices;
        self
    }

    /// Extent of one mip level, clamped to 1.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Byte size of one (mip, slice) subresource.
    pub fn mip_byte_size(&self, mip: u32) -> u64 {
        let (w, h) = self.mip_extent(mip);
        u64::from(w) * u64::from(h) * u64::from(self.format.bytes_per_pixel())
    }

    /// Bytes in one row of the given mip level.
    pub fn row_pitch(&self, mip: u32) -> u64 {
        let (w, _) = self.mip_extent(mip);
        u64::from(w) * u64::from(self.format.bytes_per_pixel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extents_clamp_to_one() {
        let desc = TextureDescriptor::new_2d(
            8,
            2,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        )
        .with_mip_levels(4);

        assert_eq!(desc.mip_extent(0), (8, 2));
        assert_eq!(desc.mip_extent(1), (4, 1));
        assert_eq!(desc.mip_extent(3), (1, 1));
    }

    #[test]
    fn mip_byte_sizes() {
        let desc = TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba32Float,
            TextureUsage::STORAGE,
        );
        assert_eq!(desc.mip_byte_size(0), 4 * 4 * 16);
        assert_eq!(desc.row_pitch(0), 4 * 16);
    }
}
