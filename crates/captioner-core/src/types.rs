//! Core data types flowing through the caption pipeline.

use image::{DynamicImage, RgbImage};
use ndarray::Array3;

/// Captions produced for one request, in generation order.
pub type CaptionResult = Vec<String>;

/// Number of color channels every [`ImageArray`] carries.
pub const RGB_CHANNELS: usize = 3;

/// A decoded image as a `height × width × 3` array of 8-bit RGB values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    pixels: Array3<u8>,
}

impl ImageArray {
    /// Flatten any decoded image (RGBA, grey, 16-bit) to 8-bit RGB.
    pub fn from_image(image: &DynamicImage) -> Self {
        Self::from_rgb(image.to_rgb8())
    }

    /// Wrap an RGB buffer without copying pixel data.
    pub fn from_rgb(rgb: RgbImage) -> Self {
        let (width, height) = rgb.dimensions();
        let pixels = Array3::from_shape_vec(
            (height as usize, width as usize, RGB_CHANNELS),
            rgb.into_raw(),
        )
        .expect("RgbImage buffer length is width * height * 3");
        Self { pixels }
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.pixels.shape()[2]
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    /// Rebuild an `RgbImage` for resampling.
    pub fn to_rgb_image(&self) -> RgbImage {
        let raw: Vec<u8> = self.pixels.iter().copied().collect();
        RgbImage::from_raw(self.width() as u32, self.height() as u32, raw)
            .expect("array shape matches image dimensions")
    }
}
