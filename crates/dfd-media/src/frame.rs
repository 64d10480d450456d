//! Decoded RGB frames.

use image::{imageops::FilterType, RgbImage};
use ndarray::Array3;

use crate::error::{MediaError, MediaResult};

/// One square RGB frame, height x width x channel, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array3<f32>,
}

impl Frame {
    /// All-zero frame used to pad short videos.
    pub fn zeros(size: u32) -> Self {
        let size = size as usize;
        Self {
            pixels: Array3::zeros((size, size, 3)),
        }
    }

    /// Build a frame from tightly packed rgb24 bytes.
    ///
    /// The image is resized to `size x size` if it does not already match.
    pub fn from_rgb24(bytes: &[u8], width: u32, height: u32, size: u32) -> MediaResult<Self> {
        let expected = width as usize * height as usize * 3;
        if bytes.len() != expected {
            return Err(MediaError::invalid_frame(format!(
                "expected {} bytes for {}x{} rgb24, got {}",
                expected,
                width,
                height,
                bytes.len()
            )));
        }
        let image = RgbImage::from_raw(width, height, bytes.to_vec())
            .ok_or_else(|| MediaError::invalid_frame("rgb24 buffer does not match dimensions"))?;
        Ok(Self::from_image(&image, size))
    }

    /// Build a frame from an RGB image, resizing bilinearly when needed.
    pub fn from_image(image: &RgbImage, size: u32) -> Self {
        let resized;
        let image = if image.width() == size && image.height() == size {
            image
        } else {
            resized = image::imageops::resize(image, size, size, FilterType::Triangle);
            &resized
        };

        let side = size as usize;
        let data: Vec<f32> = image.as_raw().iter().map(|&b| f32::from(b) / 255.0).collect();
        // Length is side * side * 3 by construction of RgbImage
        let pixels = Array3::from_shape_vec((side, side, 3), data)
            .unwrap_or_else(|_| Array3::zeros((side, side, 3)));
        Self { pixels }
    }

    /// Side length in pixels.
    pub fn size(&self) -> u32 {
        self.pixels.shape()[0] as u32
    }

    pub fn pixels(&self) -> &Array3<f32> {
        &self.pixels
    }

    /// Pixel values in row-major HWC order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.pixels.iter().copied().collect()
    }

    /// True if every pixel is zero.
    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&v| v == 0.0)
    }
}
