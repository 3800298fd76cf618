//! Copyable footprints of texture mips inside a linear buffer.
//!
//! Copies between buffers and textures require every row to start at a
//! multiple of the device's row-pitch alignment and every mip to start at a
//! multiple of its placement alignment. A footprint describes where a mip's
//! rows live in the buffer; writers must advance by `row_pitch`, not by
//! `row_size`.

use crate::resource::TextureDesc;

/// Alignment rules for buffer/texture copies reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyAlignment {
    /// Alignment of each row's start offset, in bytes.
    pub row_pitch: u64,
    /// Alignment of each mip's start offset, in bytes.
    pub placement: u64,
}

/// Placement of one mip level in a linear buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipFootprint {
    pub mip: u32,
    /// Byte offset of the first row.
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    /// Tightly packed bytes per row.
    pub row_size: u64,
    /// Distance between row starts; at least `row_size`.
    pub row_pitch: u64,
    pub row_count: u32,
}

impl MipFootprint {
    /// Bytes spanned by this mip, excluding padding after the last row.
    pub fn span(&self) -> u64 {
        if self.row_count == 0 {
            return 0;
        }
        self.row_pitch * u64::from(self.row_count - 1) + self.row_size
    }

    /// Byte offset of row `row` inside the buffer.
    pub fn row_offset(&self, row: u32) -> u64 {
        self.offset + self.row_pitch * u64::from(row)
    }

    /// Row pitch expressed in texels, as Vulkan's `bufferRowLength` wants it.
    pub fn row_length_texels(&self, bytes_per_texel: u32) -> u32 {
        if bytes_per_texel == 0 {
            return self.width;
        }
        (self.row_pitch / u64::from(bytes_per_texel)) as u32
    }
}

/// Rounds `value` up to a multiple of `alignment` (a power of two or zero).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Dimension of `extent` at mip level `mip`.
#[inline]
pub fn mip_extent(extent: u32, mip: u32) -> u32 {
    (extent >> mip).max(1)
}

/// Lays out every mip of `desc` for a buffer copy.
///
/// Returns the per-mip footprints and the total buffer size needed.
pub fn compute_footprints(desc: &TextureDesc, alignment: CopyAlignment) -> (Vec<MipFootprint>, u64) {
    let texel = u64::from(desc.format.bytes_per_texel());
    let mut offset = 0u64;
    let mut footprints = Vec::with_capacity(desc.mip_levels as usize);

    for mip in 0..desc.mip_levels {
        let width = mip_extent(desc.width, mip);
        let height = mip_extent(desc.height, mip);
        let row_size = u64::from(width) * texel;
        let row_pitch = align_up(row_size, alignment.row_pitch);

        offset = align_up(offset, alignment.placement);
        let footprint = MipFootprint {
            mip,
            offset,
            width,
            height,
            row_size,
            row_pitch,
            row_count: height,
        };
        offset += row_pitch * u64::from(height);
        footprints.push(footprint);
    }

    (footprints, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::TextureUsage;

    const D3D12_LIKE: CopyAlignment = CopyAlignment {
        row_pitch: 256,
        placement: 512,
    };

    fn desc(width: u32, height: u32, mips: u32) -> TextureDesc {
        TextureDesc::new("footprint test", width, height, Format::Rgba8Unorm)
            .with_mip_levels(mips)
            .with_usage(TextureUsage::SHADER_READ)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(12, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn test_narrow_texture_is_padded() {
        let (footprints, total) = compute_footprints(&desc(3, 2, 1), D3D12_LIKE);
        let mip0 = footprints[0];

        assert_eq!(mip0.row_size, 12);
        assert_eq!(mip0.row_pitch, 256);
        assert_eq!(mip0.row_count, 2);
        assert_eq!(mip0.span(), 256 + 12);
        assert_eq!(total, 512);
    }

    #[test]
    fn test_mip_chain_offsets_are_placed() {
        let (footprints, total) = compute_footprints(&desc(8, 8, 4), D3D12_LIKE);

        let dims: Vec<(u32, u32)> = footprints.iter().map(|f| (f.width, f.height)).collect();
        assert_eq!(dims, vec![(8, 8), (4, 4), (2, 2), (1, 1)]);
        for footprint in &footprints {
            assert_eq!(footprint.offset % 512, 0);
            assert_eq!(footprint.row_pitch, 256);
        }
        assert_eq!(footprints[1].offset, 2048);
        assert_eq!(footprints[2].offset, 2048 + 1024);
        assert_eq!(footprints[3].offset, 2048 + 1024 + 512);
        assert_eq!(total, footprints[3].offset + 256);
    }

    #[test]
    fn test_tight_alignment() {
        let tight = CopyAlignment {
            row_pitch: 1,
            placement: 1,
        };
        let (footprints, total) = compute_footprints(&desc(5, 3, 2), tight);
        assert_eq!(footprints[0].row_pitch, 20);
        assert_eq!(footprints[1].offset, 60);
        assert_eq!(total, 60 + 8);
    }

    #[test]
    fn test_row_length_texels() {
        let (footprints, _) = compute_footprints(&desc(3, 1, 1), D3D12_LIKE);
        assert_eq!(footprints[0].row_length_texels(4), 64);
        assert_eq!(footprints[0].row_offset(1), 256);
    }
}
