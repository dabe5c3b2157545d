//! Shared fixtures: tokenizer artifacts in a temp dir and a scripted model.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use captioner_core::model::feature_extractor::ImageSize;
use captioner_core::model::{
    CaptionModel, CaptionTokenizer, EncoderOutput, FeatureExtractor, FeatureExtractorConfig,
    GenerationPolicy, ModelConfig, TokenizerConfig,
};
use captioner_core::{ArtifactPaths, Config, ModelBundle, PipelineResult};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use ndarray::{Array2, Array3, Array4};

pub const EOS: u32 = 0;
pub const VOCAB_SIZE: usize = 8;
pub const IMAGE_SIZE: u32 = 4;

pub const VOCAB_JSON: &str =
    r#"{"<|endoftext|>": 0, "Ġ": 1, "c": 2, "a": 3, "t": 4, "Ġc": 5, "Ġca": 6, "Ġcat": 7}"#;
pub const MERGES_TXT: &str = "#version: 0.2\nĠ c\nĠc a\nĠca t\n";

/// Writes " cat" then end-of-text for every image, counting encoder calls.
pub struct ScriptedModel {
    config: ModelConfig,
    pub encode_calls: Arc<AtomicUsize>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        let mut config = ModelConfig::default();
        config.decoder_start_token_id = Some(EOS);
        config.eos_token_id = Some(EOS);
        config.encoder.image_size = IMAGE_SIZE;
        config.decoder.vocab_size = VOCAB_SIZE;
        Self {
            config,
            encode_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl CaptionModel for ScriptedModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn encode(&self, pixel_values: &Array4<f32>) -> PipelineResult<EncoderOutput> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(EncoderOutput {
            hidden_states: Array3::zeros((pixel_values.shape()[0], 1, 1)),
        })
    }

    fn next_token_logits(
        &self,
        input_ids: &[Vec<u32>],
        _encoder: &EncoderOutput,
    ) -> PipelineResult<Array2<f32>> {
        let mut logits = Array2::<f32>::zeros((input_ids.len(), VOCAB_SIZE));
        for (row, ids) in input_ids.iter().enumerate() {
            let next = if ids.len() == 1 { 7 } else { EOS as usize };
            logits[[row, next]] = 10.0;
            // runner-up keeps beam search honest
            logits[[row, 2]] = 1.0;
        }
        Ok(logits)
    }
}

pub fn write_tokenizer_artifacts(dir: &Path) -> ArtifactPaths {
    let paths = ArtifactPaths::in_dir(dir);
    std::fs::write(&paths.vocab, VOCAB_JSON).unwrap();
    std::fs::write(&paths.merges, MERGES_TXT).unwrap();
    std::fs::write(
        &paths.tokenizer_config,
        r#"{"bos_token": "<|endoftext|>", "eos_token": "<|endoftext|>", "unk_token": "<|endoftext|>", "tokenizer_class": "GPT2Tokenizer"}"#,
    )
    .unwrap();
    paths
}

/// A bundle around [`ScriptedModel`]; returns the model's call counter.
pub fn scripted_bundle(dir: &Path, policy: GenerationPolicy) -> (ModelBundle, Arc<AtomicUsize>) {
    let paths = write_tokenizer_artifacts(dir);
    let tokenizer =
        CaptionTokenizer::from_files(&paths.vocab, &paths.merges, TokenizerConfig::default())
            .unwrap();
    let extractor = FeatureExtractor::new(FeatureExtractorConfig {
        size: ImageSize::Square(IMAGE_SIZE),
        ..Default::default()
    })
    .unwrap();
    let model = ScriptedModel::new();
    let calls = Arc::clone(&model.encode_calls);
    (
        ModelBundle::new(extractor, tokenizer, Box::new(model), policy),
        calls,
    )
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.inference.workers = 2;
    config
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

pub fn rgba_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([10, 200, 30, 128]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}
