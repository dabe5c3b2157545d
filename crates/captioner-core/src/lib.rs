//! Captioner Core - image captioning library.
//!
//! Captioner turns an uploaded JPEG or PNG into a natural-language caption
//! using a vision encoder-decoder model exported to ONNX.
//!
//! # Architecture
//!
//! The model bundle is assembled once at startup from JSON artifacts and
//! shared read-only by every request:
//!
//! ```text
//! Upload → Validate → Sniff → Decode → Extract features → Generate → Decode tokens → JSON
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use captioner_core::{Captioner, Config, UploadedFile};
//!
//! #[tokio::main]
//! async fn main() -> captioner_core::Result<()> {
//!     let config = Config::load()?;
//!     let captioner = Captioner::load(&config)?;
//!
//!     let bytes = std::fs::read("cat.jpg")?;
//!     let file = UploadedFile::new("cat.jpg", Some("image/jpeg".into()), bytes);
//!     let response = captioner.respond(file).await;
//!     println!("{}", serde_json::to_string(&response)?);
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod artifacts;
pub mod config;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod service;
pub mod types;
pub mod upload;

// Re-exports for convenient access
pub use artifacts::ArtifactPaths;
pub use config::Config;
pub use error::{
    ArtifactError, CaptionError, Component, ConfigError, PipelineError, PipelineResult, Result,
};
pub use model::{ModelAssembler, ModelBundle};
pub use output::{CaptionResponse, ResponseBody};
pub use pipeline::{CaptionPipeline, ImageDecoder};
pub use service::Captioner;
pub use types::{CaptionResult, ImageArray};
pub use upload::{UploadedFile, ValidationOutcome, ValidationReason};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
