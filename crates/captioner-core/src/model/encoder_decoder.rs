//! Vision encoder-decoder model.
//!
//! The model is exported as two ONNX graphs: an image encoder producing
//! `last_hidden_state`, and a text decoder mapping `(input_ids,
//! encoder_hidden_states)` to next-token `logits`. Generation strategies in
//! [`super::generation`] drive any [`CaptionModel`], so the ONNX backend is
//! one implementation among others.

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array2, Array3, Array4, Axis};
use ort::session::Session;
use ort::value::Value;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::generation::GenerationPolicy;
use crate::error::{ArtifactError, PipelineError, PipelineResult};

/// Image encoder section of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub image_size: u32,
    pub num_channels: u32,
    pub hidden_size: usize,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            num_channels: 3,
            hidden_size: 768,
            extra: Map::new(),
        }
    }
}

/// Text decoder section of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    #[serde(alias = "max_position_embeddings")]
    pub n_positions: Option<usize>,
    pub bos_token_id: Option<u32>,
    #[serde(deserialize_with = "deserialize_token_id")]
    pub eos_token_id: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50257,
            n_positions: Some(1024),
            bos_token_id: Some(50256),
            eos_token_id: Some(50256),
            extra: Map::new(),
        }
    }
}

/// Contents of `config.json` for a vision encoder-decoder model.
///
/// Only the fields generation and compatibility checks need are recognized;
/// everything else lands in `extra` and is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: Option<String>,
    pub decoder_start_token_id: Option<u32>,
    #[serde(deserialize_with = "deserialize_token_id")]
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ModelConfig {
    pub fn decoder_start_token_id(&self) -> Option<u32> {
        self.decoder_start_token_id.or(self.decoder.bos_token_id)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id.or(self.decoder.eos_token_id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenIdForm {
    One(u32),
    List(Vec<u32>),
}

/// Read a token id written either as `50256` or as `[50256]`.
///
/// Lists with more than one id are rejected: generation stops on a single
/// EOS token.
pub(crate) fn deserialize_token_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<TokenIdForm>::deserialize(deserializer)? {
        None => Ok(None),
        Some(TokenIdForm::One(id)) => Ok(Some(id)),
        Some(TokenIdForm::List(ids)) => match ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => Err(D::Error::custom(format!(
                "multiple token ids {ids:?} are not supported"
            ))),
        },
    }
}

/// Encoder hidden states, `[batch, sequence, hidden]`.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub hidden_states: Array3<f32>,
}

impl EncoderOutput {
    pub fn batch_size(&self) -> usize {
        self.hidden_states.shape()[0]
    }

    /// Gather rows, e.g. to repeat one image's states for every beam.
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            hidden_states: self.hidden_states.select(Axis(0), rows),
        }
    }
}

/// An image-to-text model that generation strategies can drive.
pub trait CaptionModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    /// Run the image encoder on a `[N, C, H, W]` pixel tensor.
    fn encode(&self, pixel_values: &Array4<f32>) -> PipelineResult<EncoderOutput>;

    /// Next-token logits `[rows, vocab]` for equally long `input_ids` rows.
    ///
    /// Row `i` attends to row `i` of `encoder`.
    fn next_token_logits(
        &self,
        input_ids: &[Vec<u32>],
        encoder: &EncoderOutput,
    ) -> PipelineResult<Array2<f32>>;

    /// Generate token-id sequences for every image in `pixel_values`.
    fn generate(
        &self,
        pixel_values: &Array4<f32>,
        policy: &GenerationPolicy,
    ) -> PipelineResult<Vec<Vec<u32>>> {
        super::generation::generate(self, pixel_values, policy)
    }
}

/// Input names of the exported decoder graph.
#[derive(Debug, Clone)]
struct DecoderInputs {
    input_ids: String,
    encoder_hidden_states: String,
    encoder_attention_mask: Option<String>,
}

/// Encoder and decoder ONNX sessions.
///
/// Uses a `Mutex` per session because `Session::run` requires `&mut self`;
/// concurrent generations serialize on each graph.
pub struct OnnxEncoderDecoder {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    encoder_input: String,
    decoder_inputs: DecoderInputs,
    config: ModelConfig,
}

impl OnnxEncoderDecoder {
    /// Load both graphs. `config` comes from the model's `config.json`.
    pub fn load(
        encoder_path: &Path,
        decoder_path: &Path,
        config: ModelConfig,
    ) -> Result<Self, ArtifactError> {
        let encoder = load_session(encoder_path)?;
        let decoder = load_session(decoder_path)?;

        // Detect the input tensor name from model metadata.
        let encoder_input = encoder
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .unwrap_or_else(|| "pixel_values".to_string());

        let decoder_names: Vec<String> = decoder
            .inputs()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        let require = |name: &str| {
            decoder_names
                .iter()
                .find(|n| n.as_str() == name)
                .cloned()
                .ok_or_else(|| {
                    ArtifactError::Incompatible(format!(
                        "decoder graph {:?} has no {name:?} input (inputs: {decoder_names:?})",
                        decoder_path
                    ))
                })
        };
        let decoder_inputs = DecoderInputs {
            input_ids: require("input_ids")?,
            encoder_hidden_states: require("encoder_hidden_states")?,
            encoder_attention_mask: require("encoder_attention_mask").ok(),
        };

        tracing::debug!(
            "Loaded encoder-decoder (encoder input: {:?}, decoder inputs: {:?})",
            encoder_input,
            decoder_names
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            encoder_input,
            decoder_inputs,
            config,
        })
    }
}

fn load_session(path: &Path) -> Result<Session, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::Missing(path.to_path_buf()));
    }
    Session::builder()
        .map_err(|e| ArtifactError::Load {
            path: path.to_path_buf(),
            message: format!("Failed to create ONNX session builder: {e}"),
        })?
        .commit_from_file(path)
        .map_err(|e| ArtifactError::Load {
            path: path.to_path_buf(),
            message: format!("Failed to load ONNX model: {e}"),
        })
}

impl CaptionModel for OnnxEncoderDecoder {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn encode(&self, pixel_values: &Array4<f32>) -> PipelineResult<EncoderOutput> {
        let shape: Vec<i64> = pixel_values.shape().iter().map(|&d| d as i64).collect();
        let flat_data: Vec<f32> = pixel_values.iter().copied().collect();

        let input_value = Value::from_array((shape, flat_data)).map_err(|e| {
            PipelineError::inference(format!("Failed to create pixel tensor: {e}"))
        })?;

        let mut session = self
            .encoder
            .lock()
            .map_err(|e| PipelineError::inference(format!("Encoder lock poisoned: {e}")))?;

        let outputs = session
            .run(ort::inputs![self.encoder_input.as_str() => input_value])
            .map_err(|e| PipelineError::inference(format!("Encoder inference failed: {e}")))?;

        let hidden = outputs
            .iter()
            .find(|(name, _)| *name == "last_hidden_state")
            .or_else(|| outputs.iter().next())
            .ok_or_else(|| PipelineError::inference("Encoder produced no outputs"))?;

        let (shape, data) = hidden.1.try_extract_tensor::<f32>().map_err(|e| {
            PipelineError::inference(format!("Failed to extract encoder output: {e}"))
        })?;

        if shape.len() != 3 {
            return Err(PipelineError::inference(format!(
                "Unexpected encoder output shape: {:?}",
                shape
            )));
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        let hidden_states = Array3::from_shape_vec(dims, data.to_vec())
            .map_err(|e| PipelineError::inference(format!("Bad encoder output: {e}")))?;

        Ok(EncoderOutput { hidden_states })
    }

    fn next_token_logits(
        &self,
        input_ids: &[Vec<u32>],
        encoder: &EncoderOutput,
    ) -> PipelineResult<Array2<f32>> {
        let rows = input_ids.len();
        let seq_len = input_ids.first().map(Vec::len).unwrap_or(0);
        if rows == 0 || seq_len == 0 || rows != encoder.batch_size() {
            return Err(PipelineError::inference(format!(
                "Decoder called with {rows} rows of length {seq_len} for {} encoder rows",
                encoder.batch_size()
            )));
        }

        let ids: Vec<i64> = input_ids.iter().flatten().map(|&t| t as i64).collect();
        let ids_value = Value::from_array((vec![rows as i64, seq_len as i64], ids))
            .map_err(|e| PipelineError::inference(format!("Failed to create input_ids: {e}")))?;

        let hidden_shape: Vec<i64> = encoder
            .hidden_states
            .shape()
            .iter()
            .map(|&d| d as i64)
            .collect();
        let encoder_len = encoder.hidden_states.shape()[1];
        let hidden: Vec<f32> = encoder.hidden_states.iter().copied().collect();
        let hidden_value = Value::from_array((hidden_shape, hidden)).map_err(|e| {
            PipelineError::inference(format!("Failed to create encoder_hidden_states: {e}"))
        })?;

        let mut session = self
            .decoder
            .lock()
            .map_err(|e| PipelineError::inference(format!("Decoder lock poisoned: {e}")))?;

        let names = &self.decoder_inputs;
        let outputs = match &names.encoder_attention_mask {
            Some(mask_name) => {
                let mask = Value::from_array((
                    vec![rows as i64, encoder_len as i64],
                    vec![1i64; rows * encoder_len],
                ))
                .map_err(|e| {
                    PipelineError::inference(format!("Failed to create attention mask: {e}"))
                })?;
                session.run(ort::inputs![
                    names.input_ids.as_str() => ids_value,
                    names.encoder_hidden_states.as_str() => hidden_value,
                    mask_name.as_str() => mask
                ])
            }
            None => session.run(ort::inputs![
                names.input_ids.as_str() => ids_value,
                names.encoder_hidden_states.as_str() => hidden_value
            ]),
        }
        .map_err(|e| PipelineError::inference(format!("Decoder inference failed: {e}")))?;

        let logits = outputs
            .iter()
            .find(|(name, _)| *name == "logits")
            .or_else(|| outputs.iter().next())
            .ok_or_else(|| PipelineError::inference("Decoder produced no outputs"))?;

        let (shape, data) = logits.1.try_extract_tensor::<f32>().map_err(|e| {
            PipelineError::inference(format!("Failed to extract logits: {e}"))
        })?;

        // logits are [rows, seq, vocab]; keep the last position of each row.
        if shape.len() != 3 || shape[0] as usize != rows || shape[1] as usize != seq_len {
            return Err(PipelineError::inference(format!(
                "Unexpected logits shape: {:?}",
                shape
            )));
        }
        last_position_logits(data, rows, seq_len, shape[2] as usize)
    }
}

/// Slice the final sequence position out of row-major `[rows, seq_len, vocab]`
/// logits.
fn last_position_logits(
    data: &[f32],
    rows: usize,
    seq_len: usize,
    vocab: usize,
) -> PipelineResult<Array2<f32>> {
    if seq_len == 0 || data.len() != rows * seq_len * vocab {
        return Err(PipelineError::inference(format!(
            "Logits buffer of {} values does not match [{rows}, {seq_len}, {vocab}]",
            data.len()
        )));
    }
    let mut last = Vec::with_capacity(rows * vocab);
    for r in 0..rows {
        let start = (r * seq_len + seq_len - 1) * vocab;
        last.extend_from_slice(&data[start..start + vocab]);
    }

    Array2::from_shape_vec((rows, vocab), last)
        .map_err(|e| PipelineError::inference(format!("Bad logits: {e}")))
}
