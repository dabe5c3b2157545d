//! Model bundle assembly.
//!
//! The bundle is built once at startup from the artifacts in the model
//! directory and then shared read-only by every request.
//!
//! # Usage
//!
//! ```rust,ignore
//! use captioner_core::artifacts::ArtifactPaths;
//! use captioner_core::model::ModelAssembler;
//!
//! let paths = ArtifactPaths::in_dir(&config.model_dir());
//! let bundle = ModelAssembler::new(paths).assemble()?;
//! ```

pub mod encoder_decoder;
pub mod feature_extractor;
pub mod generation;
pub mod tokenizer;

use serde_json::{Map, Value};

use crate::artifacts::{self, ArtifactPaths};
use crate::error::{ArtifactError, CaptionError, Component, Result};

pub use encoder_decoder::{CaptionModel, EncoderOutput, ModelConfig, OnnxEncoderDecoder};
pub use feature_extractor::{FeatureExtractor, FeatureExtractorConfig};
pub use generation::GenerationPolicy;
pub use tokenizer::{CaptionTokenizer, TokenizerConfig};

/// Everything needed to caption an image.
pub struct ModelBundle {
    pub feature_extractor: FeatureExtractor,
    pub tokenizer: CaptionTokenizer,
    pub model: Box<dyn CaptionModel>,
    pub generation_policy: GenerationPolicy,
}

impl ModelBundle {
    pub fn new(
        feature_extractor: FeatureExtractor,
        tokenizer: CaptionTokenizer,
        model: Box<dyn CaptionModel>,
        generation_policy: GenerationPolicy,
    ) -> Self {
        Self {
            feature_extractor,
            tokenizer,
            model,
            generation_policy,
        }
    }
}

/// Builds a [`ModelBundle`] from an artifact directory.
pub struct ModelAssembler {
    paths: ArtifactPaths,
}

impl ModelAssembler {
    pub fn new(paths: ArtifactPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Build every component. Blocking; expect this to take seconds.
    pub fn assemble(&self) -> Result<ModelBundle> {
        let missing = self.paths.missing();
        if let Some((name, path)) = missing.first() {
            tracing::error!(
                "Missing model artifacts: {:?}",
                missing.iter().map(|(n, _)| *n).collect::<Vec<_>>()
            );
            let component = match *name {
                "merges" | "vocabulary" | "tokenizer config" => Component::Tokenizer,
                "feature extractor config" => Component::FeatureExtractor,
                "generation config" => Component::GenerationPolicy,
                _ => Component::Model,
            };
            return Err(CaptionError::model_init(
                component,
                ArtifactError::Missing(path.to_path_buf()),
            ));
        }

        let start = std::time::Instant::now();
        let feature_extractor = self
            .build_feature_extractor()
            .map_err(|e| CaptionError::model_init(Component::FeatureExtractor, e))?;
        let tokenizer = self
            .build_tokenizer()
            .map_err(|e| CaptionError::model_init(Component::Tokenizer, e))?;
        let model = self
            .build_model()
            .map_err(|e| CaptionError::model_init(Component::Model, e))?;
        let generation_policy = self
            .build_generation_policy()
            .map_err(|e| CaptionError::model_init(Component::GenerationPolicy, e))?;

        let model_vocab = model.config().decoder.vocab_size;
        if tokenizer.vocab_size() != model_vocab {
            tracing::warn!(
                "Tokenizer vocabulary ({}) differs from decoder vocabulary ({}); \
                 generated ids may not decode",
                tokenizer.vocab_size(),
                model_vocab
            );
        }

        tracing::info!("Model bundle assembled in {:?}", start.elapsed());
        Ok(ModelBundle::new(
            feature_extractor,
            tokenizer,
            Box::new(model),
            generation_policy,
        ))
    }

    pub fn build_feature_extractor(&self) -> std::result::Result<FeatureExtractor, ArtifactError> {
        let path = &self.paths.feature_extractor_config;
        let config: FeatureExtractorConfig = artifacts::load_as(path)?;
        log_ignored("feature extractor", &config.extra);
        FeatureExtractor::new(config).map_err(|message| ArtifactError::Invalid {
            path: path.clone(),
            message,
        })
    }

    pub fn build_tokenizer(&self) -> std::result::Result<CaptionTokenizer, ArtifactError> {
        let config: TokenizerConfig = artifacts::load_as(&self.paths.tokenizer_config)?;
        log_ignored("tokenizer", &config.extra);
        CaptionTokenizer::from_files(&self.paths.vocab, &self.paths.merges, config)
    }

    pub fn build_model(&self) -> std::result::Result<OnnxEncoderDecoder, ArtifactError> {
        let config: ModelConfig = artifacts::load_as(&self.paths.model_config)?;
        log_ignored("model", &config.extra);
        tracing::info!(
            "Loading encoder-decoder from {:?} and {:?}",
            self.paths.encoder_weights,
            self.paths.decoder_weights
        );
        OnnxEncoderDecoder::load(
            &self.paths.encoder_weights,
            &self.paths.decoder_weights,
            config,
        )
    }

    pub fn build_generation_policy(&self) -> std::result::Result<GenerationPolicy, ArtifactError> {
        let path = &self.paths.generation_config;
        let policy = GenerationPolicy::from_mapping(artifacts::load(path)?, path)?;
        tracing::debug!("Generation policy: {:?}", policy);
        Ok(policy)
    }
}

fn log_ignored(component: &str, extra: &Map<String, Value>) {
    if !extra.is_empty() {
        tracing::debug!(
            "Ignoring unrecognized {} config fields: {:?}",
            component,
            extra.keys().collect::<Vec<_>>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_reports_missing_artifacts_first() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelAssembler::new(ArtifactPaths::in_dir(dir.path()))
            .assemble()
            .err()
            .unwrap();
        match err {
            CaptionError::ModelInit { component, source } => {
                assert_eq!(component, Component::Model);
                assert!(matches!(source, ArtifactError::Missing(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_feature_extractor_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        std::fs::write(
            &paths.feature_extractor_config,
            r#"{"do_resize": true, "size": 32, "resample": 3, "image_mean": [0.5, 0.5, 0.5], "image_std": [0.5, 0.5, 0.5]}"#,
        )
        .unwrap();

        let extractor = ModelAssembler::new(paths).build_feature_extractor().unwrap();
        assert_eq!(extractor.output_size(), Some((32, 32)));
    }

    #[test]
    fn test_build_feature_extractor_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        std::fs::write(&paths.feature_extractor_config, "{ size: 32 }").unwrap();

        let err = ModelAssembler::new(paths).build_feature_extractor().unwrap_err();
        assert!(matches!(err, ArtifactError::Parse { .. }));
    }

    #[test]
    fn test_build_generation_policy_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(dir.path());
        std::fs::write(&paths.generation_config, r#"{"num_beams": 0}"#).unwrap();

        let err = ModelAssembler::new(paths).build_generation_policy().unwrap_err();
        assert!(err.to_string().contains("num_beams"));
    }
}
