//! Request-level orchestration.
//!
//! ```text
//! UploadedFile → validate → size limit → sniff → decode → CaptionPipeline → CaptionResponse
//! ```
//!
//! Decoding and inference run on blocking threads. Inference is additionally
//! gated by a semaphore so at most `inference.workers` generations run at once
//! while the server keeps accepting requests.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::artifacts::ArtifactPaths;
use crate::config::{Config, LimitsConfig};
use crate::error::{PipelineError, PipelineResult, Result};
use crate::model::{ModelAssembler, ModelBundle};
use crate::output::CaptionResponse;
use crate::pipeline::{CaptionPipeline, ImageDecoder};
use crate::types::CaptionResult;
use crate::upload::{self, UploadedFile, ValidationOutcome};

/// Shared captioning service. Cheap to clone.
#[derive(Clone)]
pub struct Captioner {
    pipeline: Arc<CaptionPipeline>,
    decoder: ImageDecoder,
    workers: Arc<Semaphore>,
    limits: LimitsConfig,
}

impl Captioner {
    /// Assemble the model bundle from `general.model_dir` and wrap it.
    ///
    /// Blocking. Both startup steps are logged separately so a failure
    /// names the step that broke.
    pub fn load(config: &Config) -> Result<Self> {
        let model_dir = config.model_dir();
        tracing::info!("Loading model artifacts from {:?}", model_dir);

        let bundle = ModelAssembler::new(ArtifactPaths::in_dir(&model_dir))
            .assemble()
            .inspect_err(|e| tracing::error!("Model assembly failed: {}", e))?;

        let captioner = Self::with_bundle(Arc::new(bundle), config)
            .inspect_err(|e| tracing::error!("Pipeline construction failed: {}", e))?;
        tracing::info!(
            "Caption pipeline ready ({} inference worker(s))",
            config.inference.workers
        );
        Ok(captioner)
    }

    /// Wrap an already assembled bundle.
    pub fn with_bundle(bundle: Arc<ModelBundle>, config: &Config) -> Result<Self> {
        let pipeline = CaptionPipeline::new(bundle)?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            decoder: ImageDecoder::new(config.limits.clone()),
            workers: Arc::new(Semaphore::new(config.inference.workers.max(1))),
            limits: config.limits.clone(),
        })
    }

    pub fn pipeline(&self) -> &CaptionPipeline {
        &self.pipeline
    }

    /// Caption one upload.
    pub async fn caption(&self, file: UploadedFile) -> PipelineResult<CaptionResult> {
        let start = std::time::Instant::now();

        let file = match upload::validate(file) {
            ValidationOutcome::Valid(file) => file,
            ValidationOutcome::Invalid(reason) => return Err(PipelineError::Validation(reason)),
        };

        let max_bytes = self.limits.max_upload_mb * 1024 * 1024;
        if file.bytes.len() as u64 > max_bytes {
            return Err(PipelineError::FileTooLarge {
                filename: file.filename,
                size_mb: file.bytes.len() as u64 / (1024 * 1024),
                max_mb: self.limits.max_upload_mb,
            });
        }

        let kind = upload::sniff(&file.bytes).map_err(|detected| {
            PipelineError::UnsupportedContent {
                filename: file.filename.clone(),
                detected,
            }
        })?;
        if kind.mime_type() != file.declared_type() {
            tracing::debug!(
                "{} declared {} but contains {}",
                file.filename,
                file.declared_type(),
                kind.mime_type()
            );
        }

        let decode_start = std::time::Instant::now();
        let image = self.decoder.decode(file.bytes, kind, &file.filename).await?;
        tracing::trace!("  Decode: {:?}", decode_start.elapsed());

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::inference(format!("Worker pool closed: {}", e)))?;

        let pipeline = Arc::clone(&self.pipeline);
        let captions = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.process(&image)
        })
        .await
        .map_err(|e| PipelineError::inference(format!("Task join error: {}", e)))??;

        tracing::debug!("Captioned {} in {:?}", file.filename, start.elapsed());
        Ok(captions)
    }

    /// Caption one upload and convert the outcome to the response shape.
    ///
    /// Failures are logged with the filename and declared type; input errors
    /// at warn level, failures of the model itself at error level.
    pub async fn respond(&self, file: UploadedFile) -> CaptionResponse {
        let filename = file.filename.clone();
        let declared = file.declared_type().to_string();

        let result = self.caption(file).await;
        if let Err(e) = &result {
            if e.is_input_error() {
                tracing::warn!(
                    filename = %filename,
                    declared_type = %declared,
                    "Rejected upload: {}",
                    e
                );
            } else {
                tracing::error!(
                    filename = %filename,
                    declared_type = %declared,
                    "Caption failed: {}",
                    e
                );
            }
        }
        CaptionResponse::from_result(result)
    }
}
