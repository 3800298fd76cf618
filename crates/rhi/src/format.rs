//! Texel formats understood by the core.

/// Texel format of a texture or view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Use the resource's own format (only meaningful as a view override).
    #[default]
    Unknown,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    R32Uint,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    /// Bytes occupied by one texel.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float => 16,
        }
    }

    /// Returns true for depth (and depth-stencil) formats.
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }

    /// Returns true if the format carries a stencil aspect.
    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }

    /// Returns true for sRGB-encoded color formats.
    pub fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8Srgb | Format::Bgra8Srgb)
    }

    /// Resolves a view format override against the resource's format.
    pub fn or(self, fallback: Format) -> Format {
        if self == Format::Unknown {
            fallback
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_sizes() {
        assert_eq!(Format::Rgba8Unorm.bytes_per_texel(), 4);
        assert_eq!(Format::Rgba16Float.bytes_per_texel(), 8);
        assert_eq!(Format::Rgba32Float.bytes_per_texel(), 16);
        assert_eq!(Format::Unknown.bytes_per_texel(), 0);
    }

    #[test]
    fn test_override_fallback() {
        assert_eq!(Format::Unknown.or(Format::Bgra8Srgb), Format::Bgra8Srgb);
        assert_eq!(Format::Rgba8Srgb.or(Format::Rgba8Unorm), Format::Rgba8Srgb);
    }

    #[test]
    fn test_depth_classification() {
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::Rgba8Unorm.is_depth());
    }
}
