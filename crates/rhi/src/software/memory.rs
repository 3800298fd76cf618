//! Host allocations standing in for device memory.

use std::ptr::NonNull;

use crate::format::Format;

/// A zeroed, fixed-size heap block with a stable address.
///
/// Accessed only through raw pointers so that a live CPU mapping and the
/// emulated GPU never hold overlapping references.
pub(crate) struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the block is uniquely owned and only touched under the backend lock
// or through a mapping guarded by the resource's `mapped` flag.
unsafe impl Send for HostMemory {}

impl HostMemory {
    pub(crate) fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self { ptr, len }
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice of len bytes.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Encodes a clear color into one texel of `format`.
pub(crate) fn encode_color(format: Format, color: [f32; 4]) -> Vec<u8> {
    let unorm8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        Format::R8Unorm => vec![unorm8(color[0])],
        Format::Rg8Unorm => vec![unorm8(color[0]), unorm8(color[1])],
        Format::Rgba8Unorm | Format::Rgba8Srgb => color.iter().map(|c| unorm8(*c)).collect(),
        Format::Bgra8Unorm | Format::Bgra8Srgb => {
            vec![unorm8(color[2]), unorm8(color[1]), unorm8(color[0]), unorm8(color[3])]
        }
        Format::R16Float => f32_to_f16(color[0]).to_le_bytes().to_vec(),
        Format::Rgba16Float => color
            .iter()
            .flat_map(|c| f32_to_f16(*c).to_le_bytes())
            .collect(),
        Format::R32Float => color[0].to_le_bytes().to_vec(),
        Format::R32Uint => (color[0] as u32).to_le_bytes().to_vec(),
        Format::Rg32Float => color[..2].iter().flat_map(|c| c.to_le_bytes()).collect(),
        Format::Rgb32Float => color[..3].iter().flat_map(|c| c.to_le_bytes()).collect(),
        Format::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        Format::D32Float | Format::D24UnormS8Uint => encode_depth(format, color[0]),
        Format::Unknown => Vec::new(),
    }
}

/// Encodes a depth clear value into one texel of `format`.
pub(crate) fn encode_depth(format: Format, depth: f32) -> Vec<u8> {
    match format {
        Format::D24UnormS8Uint => {
            let d = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            d.to_le_bytes().to_vec()
        }
        _ => depth.to_le_bytes().to_vec(),
    }
}

/// IEEE half from single precision, round-toward-zero on the mantissa.
fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x007F_FFFF;

    if exponent == 0xFF {
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | nan;
    }
    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1F {
        return sign | 0x7C00;
    }
    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let m = (mantissa | 0x0080_0000) >> (1 - half_exponent);
        return sign | (m >> 13) as u16;
    }
    sign | ((half_exponent as u16) << 10) | (mantissa >> 13) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_memory_is_zeroed() {
        let memory = HostMemory::zeroed(64);
        assert_eq!(memory.len(), 64);
        // SAFETY: freshly allocated, exclusively owned.
        let bytes = unsafe { std::slice::from_raw_parts(memory.ptr().as_ptr(), memory.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_color() {
        assert_eq!(
            encode_color(Format::Rgba8Unorm, [1.0, 0.0, 0.5, 1.0]),
            vec![255, 0, 128, 255]
        );
        assert_eq!(
            encode_color(Format::Bgra8Unorm, [1.0, 0.0, 0.0, 1.0]),
            vec![0, 0, 255, 255]
        );
        assert_eq!(encode_color(Format::R32Float, [2.5, 0.0, 0.0, 0.0]), 2.5f32.to_le_bytes());
    }

    #[test]
    fn test_f16() {
        assert_eq!(f32_to_f16(0.0), 0x0000);
        assert_eq!(f32_to_f16(1.0), 0x3C00);
        assert_eq!(f32_to_f16(-2.0), 0xC000);
        assert_eq!(f32_to_f16(65536.0), 0x7C00);
    }

    #[test]
    fn test_depth_encoding() {
        assert_eq!(encode_depth(Format::D32Float, 1.0), 1.0f32.to_le_bytes());
        assert_eq!(
            encode_depth(Format::D24UnormS8Uint, 1.0),
            0x00FF_FFFFu32.to_le_bytes()
        );
    }
}
