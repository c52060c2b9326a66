//! Pixel formats delivered by tile sources

use crate::pyramid::Extent;
use serde::Serialize;

/// Pixel layout of the buffers a [`TileSource`](crate::TileSource) fills.
///
/// Formats are intended for visualization, so only the common 8-bit and
/// packed 16-bit layouts are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    /// 8-bit luminance
    Monochrome,
    /// 8-bit luminance followed by 8-bit alpha
    MonochromeAlpha,
    /// Packed 5-6-5 RGB
    Rgb565,
    /// Packed 5-5-5-1 RGBA
    Rgba5551,
    Rgb24,
    Bgr24,
    Rgba32,
    Argb32,
    Bgra32,
}

impl PixelFormat {
    /// Size of one pixel in bytes.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Monochrome => 1,
            PixelFormat::MonochromeAlpha | PixelFormat::Rgb565 | PixelFormat::Rgba5551 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Argb32 | PixelFormat::Bgra32 => 4,
        }
    }

    /// Returns `true` if the format carries an alpha channel.
    pub fn has_alpha(&self) -> bool {
        matches!(
            self,
            PixelFormat::MonochromeAlpha
                | PixelFormat::Rgba5551
                | PixelFormat::Rgba32
                | PixelFormat::Argb32
                | PixelFormat::Bgra32
        )
    }

    /// Bytes needed to hold `extent` pixels in this format, or `None` on
    /// overflow.
    pub fn transfer_size(&self, extent: Extent) -> Option<usize> {
        extent.pixel_count()?.checked_mul(self.bytes_per_pixel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::Monochrome.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Bgr24.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Argb32.bytes_per_pixel(), 4);
    }

    #[test]
    fn test_alpha() {
        assert!(PixelFormat::Rgba32.has_alpha());
        assert!(!PixelFormat::Rgb24.has_alpha());
    }

    #[test]
    fn test_transfer_size() {
        assert_eq!(
            PixelFormat::Rgba32.transfer_size(Extent::new(256, 256)),
            Some(256 * 256 * 4)
        );
        assert_eq!(PixelFormat::Rgb24.transfer_size(Extent::new(0, 10)), Some(0));
        assert_eq!(
            PixelFormat::Rgba32.transfer_size(Extent::new(usize::MAX / 2, 1)),
            None
        );
    }
}
