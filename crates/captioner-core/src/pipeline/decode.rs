//! Image decoding with dimension limits and timeout support.

use image::GenericImageView;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::LimitsConfig;
use crate::error::PipelineError;
use crate::types::ImageArray;
use crate::upload::ImageKind;

/// Image decoder with configurable limits and timeout.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    limits: LimitsConfig,
}

impl ImageDecoder {
    /// Create a new decoder with the given limits.
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Decode sniffed image bytes off the async runtime, with a timeout.
    pub async fn decode(
        &self,
        bytes: Vec<u8>,
        kind: ImageKind,
        filename: &str,
    ) -> Result<ImageArray, PipelineError> {
        let filename_owned = filename.to_string();
        let max_dim = self.limits.max_image_dimension;
        let timeout_duration = Duration::from_millis(self.limits.decode_timeout_ms);

        let decode_result = timeout(timeout_duration, async {
            tokio::task::spawn_blocking(move || {
                Self::decode_sync(&bytes, kind, &filename_owned, max_dim)
            })
            .await
        })
        .await;

        match decode_result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PipelineError::ImageDecode {
                filename: filename.to_string(),
                message: format!("Task join error: {}", e),
            }),
            Err(_) => Err(PipelineError::Timeout {
                filename: filename.to_string(),
                stage: "decode".to_string(),
                timeout_ms: self.limits.decode_timeout_ms,
            }),
        }
    }

    /// Synchronous decode. Alpha and grey images are flattened to RGB.
    pub fn decode_sync(
        bytes: &[u8],
        kind: ImageKind,
        filename: &str,
        max_dim: u32,
    ) -> Result<ImageArray, PipelineError> {
        let image = image::load_from_memory_with_format(bytes, kind.format()).map_err(|e| {
            PipelineError::ImageDecode {
                filename: filename.to_string(),
                message: e.to_string(),
            }
        })?;

        let (width, height) = image.dimensions();
        if width > max_dim || height > max_dim {
            return Err(PipelineError::ImageTooLarge {
                filename: filename.to_string(),
                width,
                height,
                max_dim,
            });
        }

        if kind == ImageKind::Png && image.color().has_alpha() {
            tracing::debug!("Flattening alpha channel of {}", filename);
        }
        Ok(ImageArray::from_image(&image))
    }
}
