//! Raw pixel buffers handed over by a host (camera frame, bitmap, decoded file).

use image::{DynamicImage, RgbImage, RgbaImage};

use crate::error::{CountError, Result};

/// Channel layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgr8,
    Bgra8,
    Gray8,
    Rgb565,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Whether the counting pipeline accepts this layout.
    pub fn is_supported(self) -> bool {
        matches!(self, PixelFormat::Rgb8 | PixelFormat::Rgba8)
    }
}

/// Borrowed, tightly packed pixel data.
#[derive(Debug, Clone, Copy)]
pub struct PixelBuffer<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: &'a [u8],
}

impl<'a> PixelBuffer<'a> {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: &'a [u8]) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    pub fn rgb(width: u32, height: u32, data: &'a [u8]) -> Self {
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    pub fn rgba(width: u32, height: u32, data: &'a [u8]) -> Self {
        Self::new(width, height, PixelFormat::Rgba8, data)
    }

    /// Check format, length and dimensions without copying.
    ///
    /// Format is checked first so an unsupported layout is reported as such even when its
    /// length would also be wrong for the declared size.
    pub fn validate(&self) -> Result<()> {
        if !self.format.is_supported() {
            return Err(CountError::UnsupportedFormat {
                format: self.format,
            });
        }
        let expected =
            self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.data.len() != expected {
            return Err(CountError::BufferSize {
                expected,
                actual: self.data.len(),
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(CountError::InvalidDimension(format!(
                "image must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Copy the buffer into an owned [`DynamicImage`].
    pub fn to_dynamic_image(&self) -> Result<DynamicImage> {
        self.validate()?;
        let buffer = self.data.to_vec();
        let image = match self.format {
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, buffer)
                .map(DynamicImage::ImageRgb8),
            PixelFormat::Rgba8 => RgbaImage::from_raw(self.width, self.height, buffer)
                .map(DynamicImage::ImageRgba8),
            other => return Err(CountError::UnsupportedFormat { format: other }),
        };
        image.ok_or(CountError::BufferSize {
            expected: self.width as usize * self.height as usize * self.format.bytes_per_pixel(),
            actual: self.data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_buffer_converts() {
        let data = vec![255u8; 2 * 3 * 4];
        let buffer = PixelBuffer::rgba(2, 3, &data);
        let image = buffer.to_dynamic_image().expect("rgba is supported");
        assert_eq!(image.width(), 2);
        assert_eq!(image.height(), 3);
        assert!(matches!(image, DynamicImage::ImageRgba8(_)));
    }

    #[test]
    fn unsupported_formats_are_rejected() {
        let data = vec![0u8; 4 * 4 * 4];
        let buffer = PixelBuffer::new(4, 4, PixelFormat::Bgra8, &data);
        assert!(matches!(
            buffer.validate(),
            Err(CountError::UnsupportedFormat {
                format: PixelFormat::Bgra8
            })
        ));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let data = vec![0u8; 10];
        let buffer = PixelBuffer::rgb(2, 2, &data);
        assert!(matches!(
            buffer.validate(),
            Err(CountError::BufferSize {
                expected: 12,
                actual: 10
            })
        ));
    }

    #[test]
    fn zero_sized_buffer_is_invalid() {
        let buffer = PixelBuffer::rgb(0, 5, &[]);
        assert!(matches!(
            buffer.validate(),
            Err(CountError::InvalidDimension(_))
        ));
    }
}
