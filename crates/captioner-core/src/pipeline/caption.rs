//! Caption generation: pixels → token ids → text.

use std::sync::Arc;

use ndarray::Array4;

use crate::error::{ArtifactError, CaptionError, Component, PipelineResult, Result};
use crate::model::ModelBundle;
use crate::types::{CaptionResult, ImageArray, RGB_CHANNELS};

/// Runs the three caption stages against a shared [`ModelBundle`].
pub struct CaptionPipeline {
    bundle: Arc<ModelBundle>,
}

impl CaptionPipeline {
    /// Wrap a bundle, checking its feature extractor feeds the encoder the
    /// input geometry it was exported with.
    pub fn new(bundle: Arc<ModelBundle>) -> Result<Self> {
        let encoder = &bundle.model.config().encoder;
        if encoder.num_channels as usize != RGB_CHANNELS {
            return Err(CaptionError::model_init(
                Component::Pipeline,
                ArtifactError::Incompatible(format!(
                    "encoder expects {} channels, images are RGB",
                    encoder.num_channels
                )),
            ));
        }
        if let Some((height, width)) = bundle.feature_extractor.output_size() {
            if height != encoder.image_size || width != encoder.image_size {
                return Err(CaptionError::model_init(
                    Component::Pipeline,
                    ArtifactError::Incompatible(format!(
                        "feature extractor produces {width}x{height}, encoder expects {0}x{0}",
                        encoder.image_size
                    )),
                ));
            }
        }
        Ok(Self { bundle })
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    /// Caption one image.
    pub fn process(&self, image: &ImageArray) -> PipelineResult<CaptionResult> {
        self.process_batch(std::slice::from_ref(image))
    }

    /// Caption several images in one model call.
    ///
    /// Returns `num_return_sequences` captions per image, image-major.
    pub fn process_batch(&self, images: &[ImageArray]) -> PipelineResult<CaptionResult> {
        let start = std::time::Instant::now();

        let pixel_values = self.pixel_values(images)?;
        tracing::trace!("  Features: {:?} in {:?}", pixel_values.shape(), start.elapsed());

        let generate_start = std::time::Instant::now();
        let output_ids = self.output_ids(&pixel_values)?;
        tracing::trace!(
            "  Generate: {} sequences in {:?}",
            output_ids.len(),
            generate_start.elapsed()
        );

        let captions = self.bundle.tokenizer.decode_batch(&output_ids)?;
        tracing::debug!("Captioned {} image(s) in {:?}", images.len(), start.elapsed());
        Ok(captions)
    }

    fn pixel_values(&self, images: &[ImageArray]) -> PipelineResult<Array4<f32>> {
        self.bundle.feature_extractor.extract(images)
    }

    fn output_ids(&self, pixel_values: &Array4<f32>) -> PipelineResult<Vec<Vec<u32>>> {
        self.bundle
            .model
            .generate(pixel_values, &self.bundle.generation_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::model::feature_extractor::ImageSize;
    use crate::model::{
        CaptionModel, CaptionTokenizer, EncoderOutput, FeatureExtractor, FeatureExtractorConfig,
        GenerationPolicy, ModelConfig, TokenizerConfig,
    };
    use image::{Rgb, RgbImage};
    use ndarray::{Array2, Array3};

    /// Emits " cat" then end-of-text for every image.
    struct CatModel {
        config: ModelConfig,
    }

    impl CaptionModel for CatModel {
        fn config(&self) -> &ModelConfig {
            &self.config
        }

        fn encode(&self, pixel_values: &Array4<f32>) -> PipelineResult<EncoderOutput> {
            Ok(EncoderOutput {
                hidden_states: Array3::zeros((pixel_values.shape()[0], 1, 1)),
            })
        }

        fn next_token_logits(
            &self,
            input_ids: &[Vec<u32>],
            _encoder: &EncoderOutput,
        ) -> PipelineResult<Array2<f32>> {
            let next = if input_ids[0].len() == 1 { 7 } else { 0 };
            let mut logits = Array2::<f32>::zeros((input_ids.len(), 8));
            logits.column_mut(next).fill(10.0);
            Ok(logits)
        }
    }

    fn bundle(extractor_size: u32, encoder_size: u32) -> (tempfile::TempDir, Arc<ModelBundle>) {
        let dir = tempfile::tempdir().unwrap();
        let vocab = dir.path().join("vocab.json");
        let merges = dir.path().join("merges.txt");
        std::fs::write(
            &vocab,
            r#"{"<|endoftext|>": 0, "Ġ": 1, "c": 2, "a": 3, "t": 4, "Ġc": 5, "Ġca": 6, "Ġcat": 7}"#,
        )
        .unwrap();
        std::fs::write(&merges, "#version: 0.2\nĠ c\nĠc a\nĠca t\n").unwrap();
        let tokenizer =
            CaptionTokenizer::from_files(&vocab, &merges, TokenizerConfig::default()).unwrap();

        let extractor = FeatureExtractor::new(FeatureExtractorConfig {
            size: ImageSize::Square(extractor_size),
            ..Default::default()
        })
        .unwrap();

        let mut config = ModelConfig::default();
        config.decoder_start_token_id = Some(0);
        config.eos_token_id = Some(0);
        config.encoder.image_size = encoder_size;
        config.decoder.vocab_size = 8;

        let bundle = ModelBundle::new(
            extractor,
            tokenizer,
            Box::new(CatModel { config }),
            GenerationPolicy::default(),
        );
        (dir, Arc::new(bundle))
    }

    fn image() -> ImageArray {
        ImageArray::from_rgb(RgbImage::from_pixel(6, 5, Rgb([10, 20, 30])))
    }

    #[test]
    fn test_process_produces_caption() {
        let (_dir, bundle) = bundle(4, 4);
        let pipeline = CaptionPipeline::new(bundle).unwrap();
        assert_eq!(pipeline.process(&image()).unwrap(), vec!["cat".to_string()]);
    }

    #[test]
    fn test_process_batch_one_caption_per_image() {
        let (_dir, bundle) = bundle(4, 4);
        let pipeline = CaptionPipeline::new(bundle).unwrap();
        let captions = pipeline.process_batch(&[image(), image()]).unwrap();
        assert_eq!(captions, vec!["cat".to_string(), "cat".to_string()]);
    }

    #[test]
    fn test_empty_batch_is_a_feature_error() {
        let (_dir, bundle) = bundle(4, 4);
        let pipeline = CaptionPipeline::new(bundle).unwrap();
        let err = pipeline.process_batch(&[]).unwrap_err();
        assert!(matches!(err, PipelineError::FeatureExtraction { .. }));
    }

    #[test]
    fn test_rejects_mismatched_resolution() {
        let (_dir, bundle) = bundle(4, 8);
        match CaptionPipeline::new(bundle).err().unwrap() {
            CaptionError::ModelInit { component, source } => {
                assert_eq!(component, Component::Pipeline);
                assert!(matches!(source, ArtifactError::Incompatible(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
