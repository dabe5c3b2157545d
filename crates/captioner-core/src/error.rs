//! Error types for the Captioner service.
//!
//! Errors are organized by stage: startup errors (service config, model
//! artifacts, model initialization) halt the process, while pipeline errors
//! are per-request and end up in the error response shape.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::upload::ValidationReason;

/// Top-level error type for Captioner operations.
#[derive(Error, Debug)]
pub enum CaptionError {
    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// One of the model bundle components could not be built
    #[error("Failed to initialize {component}: {source}")]
    ModelInit {
        component: Component,
        #[source]
        source: ArtifactError,
    },

    /// Per-request pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaptionError {
    /// Wrap an artifact error as an initialization failure of `component`.
    pub fn model_init(component: Component, source: ArtifactError) -> Self {
        Self::ModelInit { component, source }
    }
}

/// The startup components whose construction is reported independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    FeatureExtractor,
    Tokenizer,
    Model,
    GenerationPolicy,
    Pipeline,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::FeatureExtractor => "feature extractor",
            Component::Tokenizer => "tokenizer",
            Component::Model => "encoder-decoder model",
            Component::GenerationPolicy => "generation policy",
            Component::Pipeline => "caption pipeline",
        };
        f.write_str(name)
    }
}

/// Service configuration errors (the TOML config file).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Errors raised while reading model artifacts from disk.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// The artifact file is missing or unreadable
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The artifact is not well-formed JSON
    #[error("Malformed JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Well-formed JSON with unexpected structure or values
    #[error("Invalid config {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    /// A required artifact does not exist
    #[error("Artifact not found: {0}")]
    Missing(PathBuf),

    /// A binary artifact (weights, vocabulary) failed to load
    #[error("Failed to load {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// Components were built from artifacts that do not fit together
    #[error("Incompatible artifacts: {0}")]
    Incompatible(String),
}

/// Per-request pipeline errors, organized by stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Declared extension and/or content type rejected
    #[error("{0}")]
    Validation(ValidationReason),

    /// Upload body could not be read
    #[error("Failed to read upload {filename}: {message}")]
    Read { filename: String, message: String },

    /// Upload exceeds size limit
    #[error("File too large: {filename} ({size_mb}MB > {max_mb}MB)")]
    FileTooLarge {
        filename: String,
        size_mb: u64,
        max_mb: u64,
    },

    /// Sniffed content is not an accepted image type
    #[error("Invalid File Signature: {filename} contains {detected}")]
    UnsupportedContent { filename: String, detected: String },

    /// Image decoding failed
    #[error("Decode error for {filename}: {message}")]
    ImageDecode { filename: String, message: String },

    /// Image dimensions exceed limit
    #[error("Image too large: {filename} ({width}x{height} > {max_dim})")]
    ImageTooLarge {
        filename: String,
        width: u32,
        height: u32,
        max_dim: u32,
    },

    /// Operation timed out
    #[error("Timeout in {stage} stage for {filename} after {timeout_ms}ms")]
    Timeout {
        filename: String,
        stage: String,
        timeout_ms: u64,
    },

    /// Pixel feature extraction failed
    #[error("Feature extraction failed: {message}")]
    FeatureExtraction { message: String },

    /// The model's generate call failed
    #[error("Inference failed: {message}")]
    Inference { message: String },

    /// Token ids could not be decoded to text
    #[error("Decoding failed: {message}")]
    Decoding { message: String },
}

impl PipelineError {
    /// Shorthand for an inference failure.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Whether the error was caused by the uploaded input rather than by the
    /// service's own artifacts.
    pub fn is_input_error(&self) -> bool {
        !matches!(
            self,
            PipelineError::FeatureExtraction { .. }
                | PipelineError::Inference { .. }
                | PipelineError::Decoding { .. }
        )
    }
}

/// Convenience type alias for Captioner results.
pub type Result<T> = std::result::Result<T, CaptionError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
