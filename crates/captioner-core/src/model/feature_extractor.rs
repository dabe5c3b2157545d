//! Image feature extraction for the vision encoder.
//!
//! Turns [`ImageArray`]s into the NCHW `f32` pixel tensor the encoder was
//! trained on: resize, rescale to [0, 1], normalize per channel.

use image::imageops::FilterType;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::types::{ImageArray, RGB_CHANNELS};

/// Target resolution, either square or explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Square(u32),
    Dims { height: u32, width: u32 },
}

impl ImageSize {
    /// `(height, width)`.
    pub fn dims(&self) -> (u32, u32) {
        match *self {
            ImageSize::Square(side) => (side, side),
            ImageSize::Dims { height, width } => (height, width),
        }
    }
}

/// Contents of `preprocessor_config.json`.
///
/// Unrecognized keys (`feature_extractor_type`, `processor_class`, ...) are
/// collected in `extra` and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureExtractorConfig {
    pub do_resize: bool,
    pub size: ImageSize,
    /// PIL resampling filter code
    pub resample: u8,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: ImageSize::Square(224),
            resample: 2,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            extra: Map::new(),
        }
    }
}

impl FeatureExtractorConfig {
    /// Map the PIL filter code onto an `image` filter.
    pub fn filter(&self) -> Option<FilterType> {
        match self.resample {
            0 => Some(FilterType::Nearest),
            1 => Some(FilterType::Lanczos3),
            2 | 4 | 5 => Some(FilterType::Triangle),
            3 => Some(FilterType::CatmullRom),
            _ => None,
        }
    }
}

/// Maps image arrays to encoder-ready pixel tensors.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureExtractorConfig,
    filter: FilterType,
}

impl FeatureExtractor {
    /// Build from a config, rejecting values the extractor cannot honor.
    pub fn new(config: FeatureExtractorConfig) -> Result<Self, String> {
        let filter = config
            .filter()
            .ok_or_else(|| format!("unsupported resample filter {}", config.resample))?;
        let (height, width) = config.size.dims();
        if config.do_resize && (height == 0 || width == 0) {
            return Err("size must be > 0".to_string());
        }
        if config.do_normalize && config.image_std.iter().any(|&s| s <= 0.0) {
            return Err("image_std values must be > 0".to_string());
        }
        Ok(Self { config, filter })
    }

    pub fn config(&self) -> &FeatureExtractorConfig {
        &self.config
    }

    /// Output `(height, width)` when resizing is enabled.
    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.config.do_resize.then(|| self.config.size.dims())
    }

    /// Convert a batch of images into one `[N, 3, H, W]` tensor.
    pub fn extract(&self, images: &[ImageArray]) -> Result<Array4<f32>, PipelineError> {
        let first = images.first().ok_or_else(|| PipelineError::FeatureExtraction {
            message: "empty image batch".to_string(),
        })?;
        let (height, width) = match self.output_size() {
            Some((h, w)) => (h as usize, w as usize),
            None => (first.height(), first.width()),
        };

        let mut tensor = Array4::<f32>::zeros((images.len(), RGB_CHANNELS, height, width));
        for (n, image) in images.iter().enumerate() {
            let rgb = if self.config.do_resize {
                image::imageops::resize(
                    &image.to_rgb_image(),
                    width as u32,
                    height as u32,
                    self.filter,
                )
            } else if image.height() == height && image.width() == width {
                image.to_rgb_image()
            } else {
                return Err(PipelineError::FeatureExtraction {
                    message: format!(
                        "image {n} is {}x{}, expected {width}x{height} with resizing disabled",
                        image.width(),
                        image.height()
                    ),
                });
            };

            for (i, pixel) in rgb.as_raw().chunks_exact(RGB_CHANNELS).enumerate() {
                let y = i / width;
                let x = i % width;
                for (c, &val) in pixel.iter().enumerate() {
                    tensor[[n, c, y, x]] = self.normalize(val, c);
                }
            }
        }

        Ok(tensor)
    }

    fn normalize(&self, val: u8, channel: usize) -> f32 {
        let mut v = val as f32;
        if self.config.do_rescale {
            v *= self.config.rescale_factor;
        }
        if self.config.do_normalize {
            v = (v - self.config.image_mean[channel]) / self.config.image_std[channel];
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> ImageArray {
        ImageArray::from_rgb(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn test_extract_shape() {
        let extractor = FeatureExtractor::new(FeatureExtractorConfig::default()).unwrap();
        let tensor = extractor.extract(&[solid(640, 480, [0, 0, 0])]).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_extract_rectangular_size() {
        let config = FeatureExtractorConfig {
            size: ImageSize::Dims {
                height: 32,
                width: 48,
            },
            ..Default::default()
        };
        let extractor = FeatureExtractor::new(config).unwrap();
        let tensor = extractor
            .extract(&[solid(10, 10, [1, 2, 3]), solid(5, 7, [4, 5, 6])])
            .unwrap();
        assert_eq!(tensor.shape(), &[2, 3, 32, 48]);
    }

    #[test]
    fn test_normalization_range() {
        let extractor = FeatureExtractor::new(FeatureExtractorConfig::default()).unwrap();

        // White -> (1.0 - 0.5) / 0.5 = 1.0
        let tensor = extractor.extract(&[solid(8, 8, [255, 255, 255])]).unwrap();
        let max_val = tensor.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!((max_val - 1.0).abs() < 0.01);

        // Black -> (0.0 - 0.5) / 0.5 = -1.0
        let tensor = extractor.extract(&[solid(8, 8, [0, 0, 0])]).unwrap();
        let min_val = tensor.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!((min_val + 1.0).abs() < 0.01);
    }

    #[test]
    fn test_channels_land_in_nchw_planes() {
        let config = FeatureExtractorConfig {
            size: ImageSize::Square(2),
            do_normalize: false,
            do_rescale: false,
            ..Default::default()
        };
        let extractor = FeatureExtractor::new(config).unwrap();
        let tensor = extractor.extract(&[solid(2, 2, [10, 20, 30])]).unwrap();
        assert_eq!(tensor[[0, 0, 1, 1]], 10.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 20.0);
        assert_eq!(tensor[[0, 2, 1, 0]], 30.0);
    }

    #[test]
    fn test_no_resize_requires_matching_dims() {
        let config = FeatureExtractorConfig {
            do_resize: false,
            ..Default::default()
        };
        let extractor = FeatureExtractor::new(config).unwrap();
        let err = extractor
            .extract(&[solid(4, 4, [0, 0, 0]), solid(3, 4, [0, 0, 0])])
            .unwrap_err();
        assert!(matches!(err, PipelineError::FeatureExtraction { .. }));
    }

    #[test]
    fn test_config_parses_vit_preprocessor() {
        let json = r#"{
            "do_normalize": true,
            "do_resize": true,
            "feature_extractor_type": "ViTFeatureExtractor",
            "image_mean": [0.5, 0.5, 0.5],
            "image_std": [0.5, 0.5, 0.5],
            "resample": 2,
            "size": 224
        }"#;
        let config: FeatureExtractorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.size, ImageSize::Square(224));
        assert!(config.extra.contains_key("feature_extractor_type"));
    }

    #[test]
    fn test_rejects_unknown_filter() {
        let config = FeatureExtractorConfig {
            resample: 9,
            ..Default::default()
        };
        assert!(FeatureExtractor::new(config).is_err());
    }

    #[test]
    fn test_empty_batch_is_error() {
        let extractor = FeatureExtractor::new(FeatureExtractorConfig::default()).unwrap();
        assert!(extractor.extract(&[]).is_err());
    }
}
