//! On-disk model artifacts.
//!
//! A model directory holds one JSON document per concern plus the vocabulary,
//! merge rules and the exported encoder/decoder graphs:
//!
//! ```text
//! models/
//! ├── config.json                  encoder-decoder architecture
//! ├── preprocessor_config.json     feature extractor
//! ├── tokenizer_config.json        special tokens
//! ├── vocab.json                   BPE vocabulary
//! ├── merges.txt                   BPE merge rules
//! ├── encoder_model.onnx           image encoder weights
//! ├── decoder_model.onnx           text decoder weights
//! └── model_generate_config.json   generation policy
//! ```

pub mod loader;

use std::path::{Path, PathBuf};

pub use loader::{load, load_as};

pub const MODEL_CONFIG_FILENAME: &str = "config.json";
pub const MERGES_FILENAME: &str = "merges.txt";
pub const VOCAB_FILENAME: &str = "vocab.json";
pub const TOKENIZER_CONFIG_FILENAME: &str = "tokenizer_config.json";
pub const FEATURE_EXTRACTOR_CONFIG_FILENAME: &str = "preprocessor_config.json";
pub const ENCODER_WEIGHTS_FILENAME: &str = "encoder_model.onnx";
pub const DECODER_WEIGHTS_FILENAME: &str = "decoder_model.onnx";
pub const GENERATION_CONFIG_FILENAME: &str = "model_generate_config.json";

/// Locations of every artifact the model bundle is assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model_config: PathBuf,
    pub merges: PathBuf,
    pub vocab: PathBuf,
    pub tokenizer_config: PathBuf,
    pub feature_extractor_config: PathBuf,
    pub encoder_weights: PathBuf,
    pub decoder_weights: PathBuf,
    pub generation_config: PathBuf,
}

impl ArtifactPaths {
    /// The standard artifact layout inside `model_dir`.
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            model_config: model_dir.join(MODEL_CONFIG_FILENAME),
            merges: model_dir.join(MERGES_FILENAME),
            vocab: model_dir.join(VOCAB_FILENAME),
            tokenizer_config: model_dir.join(TOKENIZER_CONFIG_FILENAME),
            feature_extractor_config: model_dir.join(FEATURE_EXTRACTOR_CONFIG_FILENAME),
            encoder_weights: model_dir.join(ENCODER_WEIGHTS_FILENAME),
            decoder_weights: model_dir.join(DECODER_WEIGHTS_FILENAME),
            generation_config: model_dir.join(GENERATION_CONFIG_FILENAME),
        }
    }

    /// All artifacts as `(name, path)` pairs.
    pub fn entries(&self) -> [(&'static str, &Path); 8] {
        [
            ("model config", &self.model_config),
            ("merges", &self.merges),
            ("vocabulary", &self.vocab),
            ("tokenizer config", &self.tokenizer_config),
            ("feature extractor config", &self.feature_extractor_config),
            ("encoder weights", &self.encoder_weights),
            ("decoder weights", &self.decoder_weights),
            ("generation config", &self.generation_config),
        ]
    }

    /// Artifacts that do not exist on disk.
    pub fn missing(&self) -> Vec<(&'static str, &Path)> {
        self.entries()
            .into_iter()
            .filter(|(_, path)| !path.exists())
            .collect()
    }
}
