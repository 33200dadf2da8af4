//! Borrowed frame views and image crate adapters

use crate::{Error, Result};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Packed pixel formats accepted by the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackedFormat {
    /// 3 bytes per pixel, R G B
    #[default]
    Rgb,
    /// 4 bytes per pixel, R G B A (alpha ignored)
    Rgba,
}

impl PackedFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PackedFormat::Rgb => 3,
            PackedFormat::Rgba => 4,
        }
    }

    /// Map a pixel stride in bytes to a format
    pub fn from_bytes_per_pixel(bpp: usize) -> Result<Self> {
        match bpp {
            3 => Ok(PackedFormat::Rgb),
            4 => Ok(PackedFormat::Rgba),
            other => Err(Error::InvalidInput(format!(
                "unsupported pixel stride {} (expected 3 or 4)",
                other
            ))),
        }
    }
}

/// Memory layout of a packed source image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub format: PackedFormat,
    /// Bytes between the starts of consecutive rows
    pub row_stride: usize,
}

impl PackedLayout {
    /// Tightly packed rows
    pub fn tight(format: PackedFormat, width: u32) -> Self {
        Self {
            format,
            row_stride: width as usize * format.bytes_per_pixel(),
        }
    }
}

/// A borrowed packed image, valid for the duration of one call
#[derive(Debug, Clone, Copy)]
pub struct PackedFrame<'a> {
    pub data: &'a [u8],
    pub layout: PackedLayout,
}

impl<'a> PackedFrame<'a> {
    pub fn new(data: &'a [u8], format: PackedFormat, row_stride: usize) -> Self {
        Self {
            data,
            layout: PackedLayout { format, row_stride },
        }
    }

    /// Tightly packed RGB rows
    pub fn rgb(data: &'a [u8], width: u32) -> Self {
        Self {
            data,
            layout: PackedLayout::tight(PackedFormat::Rgb, width),
        }
    }

    /// Tightly packed RGBA rows
    pub fn rgba(data: &'a [u8], width: u32) -> Self {
        Self {
            data,
            layout: PackedLayout::tight(PackedFormat::Rgba, width),
        }
    }

    pub fn from_rgb_image(img: &'a RgbImage) -> Self {
        Self::rgb(img.as_raw(), img.width())
    }

    pub fn from_rgba_image(img: &'a RgbaImage) -> Self {
        Self::rgba(img.as_raw(), img.width())
    }
}

/// Owned packed pixels converted from any decoded image
#[derive(Debug, Clone)]
pub struct OwnedPackedImage {
    pub width: u32,
    pub height: u32,
    pub format: PackedFormat,
    pub data: Vec<u8>,
}

impl OwnedPackedImage {
    /// Keep RGBA sources as RGBA, everything else becomes RGB
    pub fn from_dynamic_image(img: &DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        match img {
            DynamicImage::ImageRgba8(rgba) => Self {
                width,
                height,
                format: PackedFormat::Rgba,
                data: rgba.as_raw().clone(),
            },
            other => Self {
                width,
                height,
                format: PackedFormat::Rgb,
                data: other.to_rgb8().into_raw(),
            },
        }
    }

    pub fn as_frame(&self) -> PackedFrame<'_> {
        PackedFrame {
            data: &self.data,
            layout: PackedLayout::tight(self.format, self.width),
        }
    }
}

/// A borrowed I420 frame: luma plane followed by the Cb and Cr planes
#[derive(Debug, Clone, Copy)]
pub struct PlanarFrame<'a> {
    pub width: u32,
    pub height: u32,
    data: &'a [u8],
}

impl<'a> PlanarFrame<'a> {
    /// Wrap a contiguous I420 buffer; its length must be exactly `w*h*3/2`
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self> {
        let expected = yuv420_size(width, height);
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "expected planar buffer of {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn y(&self) -> &'a [u8] {
        &self.data[..self.luma_len()]
    }

    pub fn u(&self) -> &'a [u8] {
        let start = self.luma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn v(&self) -> &'a [u8] {
        let start = self.luma_len() + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        (self.width as usize / 2) * (self.height as usize / 2)
    }
}

/// Byte size of an I420 frame
pub fn yuv420_size(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    luma + 2 * ((width as usize / 2) * (height as usize / 2))
}

/// Check the even, non-zero dimension precondition
pub fn validate_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(Error::InvalidDimensions { width, height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_frame_planes() {
        let data: Vec<u8> = (0..24).collect();
        let frame = PlanarFrame::new(&data, 4, 4).unwrap();
        assert_eq!(frame.y().len(), 16);
        assert_eq!(frame.u(), &[16, 17, 18, 19]);
        assert_eq!(frame.v(), &[20, 21, 22, 23]);
    }

    #[test]
    fn test_planar_frame_rejects_wrong_length() {
        let data = vec![0u8; 23];
        assert!(matches!(
            PlanarFrame::new(&data, 4, 4),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_dimensions() {
        assert!(validate_dimensions(320, 240).is_ok());
        assert!(validate_dimensions(0, 240).is_err());
        assert!(validate_dimensions(321, 240).is_err());
        assert!(validate_dimensions(320, 239).is_err());
    }

    #[test]
    fn test_dynamic_image_keeps_rgba() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::new(4, 2));
        let packed = OwnedPackedImage::from_dynamic_image(&rgba);
        assert_eq!(packed.format, PackedFormat::Rgba);
        assert_eq!(packed.as_frame().layout.row_stride, 16);

        let luma = DynamicImage::ImageLuma8(image::GrayImage::new(4, 2));
        let packed = OwnedPackedImage::from_dynamic_image(&luma);
        assert_eq!(packed.format, PackedFormat::Rgb);
        assert_eq!(packed.data.len(), 24);
    }

    #[test]
    fn test_pixel_stride_mapping() {
        assert_eq!(PackedFormat::from_bytes_per_pixel(4).unwrap(), PackedFormat::Rgba);
        assert!(PackedFormat::from_bytes_per_pixel(2).is_err());
    }
}
