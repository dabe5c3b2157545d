//! Token-sequence generation over a [`CaptionModel`].
//!
//! Three strategies, selected by the [`GenerationPolicy`]:
//!
//! - greedy: `num_beams == 1`, `do_sample == false`
//! - multinomial sampling: `do_sample == true` (temperature, top-k, top-p)
//! - beam search: `num_beams > 1`, with length-normalized hypotheses
//!
//! Every returned sequence starts with the decoder start token and ends with
//! EOS unless the length limit was reached first.

use std::path::Path;

use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::encoder_decoder::{deserialize_token_id, CaptionModel, EncoderOutput, ModelConfig};
use crate::artifacts::loader;
use crate::error::{ArtifactError, PipelineError, PipelineResult};

/// Keys written by export tooling that carry no generation semantics.
const METADATA_KEYS: [&str; 2] = ["transformers_version", "_from_model_config"];

/// Contents of `model_generate_config.json`.
///
/// Unknown keys are rejected rather than ignored: a misspelled flag would
/// otherwise change captions without any signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationPolicy {
    /// Maximum sequence length, counting the decoder start token
    pub max_length: usize,
    /// Overrides `max_length` when set
    pub max_new_tokens: Option<usize>,
    /// EOS is suppressed until the sequence reaches this length
    pub min_length: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub length_penalty: f32,
    pub early_stopping: bool,
    /// Seed for sampling; unseeded sampling draws from OS entropy
    pub seed: Option<u64>,
    pub decoder_start_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    /// A bare id or a one-element list
    #[serde(deserialize_with = "deserialize_token_id")]
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            max_length: 20,
            max_new_tokens: None,
            min_length: 0,
            num_beams: 1,
            num_return_sequences: 1,
            do_sample: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            length_penalty: 1.0,
            early_stopping: false,
            seed: None,
            decoder_start_token_id: None,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
        }
    }
}

impl GenerationPolicy {
    /// Build a policy from a loaded JSON mapping, dropping export metadata.
    pub fn from_mapping(mut map: Map<String, Value>, path: &Path) -> Result<Self, ArtifactError> {
        for key in METADATA_KEYS {
            map.remove(key);
        }
        let policy: Self = loader::from_mapping(map, path)?;
        policy.validate().map_err(|message| ArtifactError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(policy)
    }

    /// Check parameter ranges and combinations.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_length == 0 {
            return Err("max_length must be > 0".into());
        }
        if self.max_new_tokens == Some(0) {
            return Err("max_new_tokens must be > 0".into());
        }
        if self.num_beams == 0 {
            return Err("num_beams must be > 0".into());
        }
        if self.num_return_sequences == 0 {
            return Err("num_return_sequences must be > 0".into());
        }
        if !(self.temperature > 0.0) {
            return Err("temperature must be > 0".into());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err("top_p must be in (0, 1]".into());
        }
        if !(self.repetition_penalty > 0.0) {
            return Err("repetition_penalty must be > 0".into());
        }
        if self.do_sample && self.num_beams > 1 {
            return Err("beam sampling (do_sample with num_beams > 1) is not supported".into());
        }
        if !self.do_sample && self.num_return_sequences > self.num_beams {
            return Err(format!(
                "num_return_sequences ({}) must be <= num_beams ({}) without sampling",
                self.num_return_sequences, self.num_beams
            ));
        }
        Ok(())
    }

    /// Whether repeated runs on the same input give the same output.
    pub fn is_deterministic(&self) -> bool {
        !self.do_sample || self.seed.is_some()
    }

    /// Sequences generated per input image.
    pub fn sequences_per_image(&self) -> usize {
        self.num_return_sequences
    }

    fn length_limit(&self) -> usize {
        self.max_new_tokens
            .map(|n| n + 1)
            .unwrap_or(self.max_length)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Token ids resolved from the policy first, then the model config.
#[derive(Debug, Clone, Copy)]
struct SpecialIds {
    start: u32,
    eos: Option<u32>,
    pad: u32,
}

impl SpecialIds {
    fn resolve(policy: &GenerationPolicy, config: &ModelConfig) -> PipelineResult<Self> {
        let start = policy
            .decoder_start_token_id
            .or(policy.bos_token_id)
            .or(config.decoder_start_token_id())
            .ok_or_else(|| PipelineError::inference("no decoder start token id configured"))?;
        let eos = policy.eos_token_id.or(config.eos_token_id());
        let pad = policy
            .pad_token_id
            .or(config.pad_token_id)
            .or(eos)
            .unwrap_or(start);
        Ok(Self { start, eos, pad })
    }
}

/// Generate token-id sequences for every image in `pixel_values`.
///
/// Output order is image-major: all sequences of image 0, then image 1, ...
pub fn generate<M: CaptionModel + ?Sized>(
    model: &M,
    pixel_values: &Array4<f32>,
    policy: &GenerationPolicy,
) -> PipelineResult<Vec<Vec<u32>>> {
    policy.validate().map_err(PipelineError::inference)?;
    let ids = SpecialIds::resolve(policy, model.config())?;

    let mut limit = policy.length_limit();
    if let Some(n_positions) = model.config().decoder.n_positions {
        limit = limit.min(n_positions);
    }

    let encoder = model.encode(pixel_values)?;
    if encoder.batch_size() != pixel_values.shape()[0] {
        return Err(PipelineError::inference(format!(
            "Encoder returned {} rows for {} images",
            encoder.batch_size(),
            pixel_values.shape()[0]
        )));
    }

    if policy.num_beams > 1 {
        beam_search(model, &encoder, policy, ids, limit)
    } else {
        sample_or_greedy(model, &encoder, policy, ids, limit)
    }
}

fn sample_or_greedy<M: CaptionModel + ?Sized>(
    model: &M,
    encoder: &EncoderOutput,
    policy: &GenerationPolicy,
    ids: SpecialIds,
    limit: usize,
) -> PipelineResult<Vec<Vec<u32>>> {
    let copies = policy.num_return_sequences;
    let rows: Vec<usize> = (0..encoder.batch_size())
        .flat_map(|b| std::iter::repeat(b).take(copies))
        .collect();
    let encoder = encoder.select(&rows);

    let mut sequences = vec![vec![ids.start]; rows.len()];
    let mut finished = vec![false; rows.len()];
    let mut rng = policy.rng();
    let mut cur_len = 1;

    while cur_len < limit && !finished.iter().all(|&f| f) {
        let logits = model.next_token_logits(&sequences, &encoder)?;
        check_logits(&logits, sequences.len())?;

        for (row, seq) in sequences.iter_mut().enumerate() {
            if finished[row] {
                seq.push(ids.pad);
                continue;
            }
            let mut scores = logits.row(row).to_vec();
            process_logits(&mut scores, seq, policy, ids.eos);
            let next = if policy.do_sample {
                sample(&mut scores, policy, &mut rng)
            } else {
                argmax(&scores)
            };
            seq.push(next);
            if Some(next) == ids.eos {
                finished[row] = true;
            }
        }
        cur_len += 1;
    }

    Ok(sequences
        .into_iter()
        .map(|seq| truncate_after_eos(seq, ids.eos))
        .collect())
}

/// A finished beam.
#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

/// Beam search state for one image.
struct BeamState {
    beams: Vec<(Vec<u32>, f32)>,
    finished: Vec<Hypothesis>,
    done: bool,
}

impl BeamState {
    fn new(start: u32) -> Self {
        Self {
            beams: vec![(vec![start], 0.0)],
            finished: Vec::new(),
            done: false,
        }
    }

    fn add(
        &mut self,
        tokens: Vec<u32>,
        sum_logprobs: f32,
        policy: &GenerationPolicy,
        eos: Option<u32>,
    ) {
        let length = generated_len(&tokens, eos);
        let score = sum_logprobs / normalizer(length, policy.length_penalty);
        self.finished.push(Hypothesis { tokens, score });
        self.finished.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.finished.truncate(policy.num_beams);
    }

    fn is_done(&self, policy: &GenerationPolicy, cur_len: usize) -> bool {
        if self.beams.is_empty() {
            return true;
        }
        if self.finished.len() < policy.num_beams {
            return false;
        }
        if policy.early_stopping {
            return true;
        }
        let best_running =
            self.beams[0].1 / normalizer(cur_len.saturating_sub(1), policy.length_penalty);
        let worst_finished = self.finished[self.finished.len() - 1].score;
        worst_finished >= best_running
    }
}

fn beam_search<M: CaptionModel + ?Sized>(
    model: &M,
    encoder: &EncoderOutput,
    policy: &GenerationPolicy,
    ids: SpecialIds,
    limit: usize,
) -> PipelineResult<Vec<Vec<u32>>> {
    let num_beams = policy.num_beams;
    let mut states: Vec<BeamState> = (0..encoder.batch_size())
        .map(|_| BeamState::new(ids.start))
        .collect();
    let mut cur_len = 1;

    while cur_len < limit && states.iter().any(|s| !s.done) {
        let mut row_image = Vec::new();
        let mut inputs = Vec::new();
        for (image, state) in states.iter().enumerate().filter(|(_, s)| !s.done) {
            for (tokens, _) in &state.beams {
                row_image.push(image);
                inputs.push(tokens.clone());
            }
        }

        let logits = model.next_token_logits(&inputs, &encoder.select(&row_image))?;
        check_logits(&logits, inputs.len())?;

        let mut row = 0;
        for state in states.iter_mut().filter(|s| !s.done) {
            // (cumulative log-prob, beam index, token)
            let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
            for (beam_idx, (tokens, beam_score)) in state.beams.iter().enumerate() {
                let mut scores = logits.row(row).to_vec();
                row += 1;
                process_logits(&mut scores, tokens, policy, ids.eos);
                log_softmax_in_place(&mut scores);
                for (token, logprob) in top_indices(&scores, 2 * num_beams) {
                    candidates.push((beam_score + logprob, beam_idx, token));
                }
            }
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(2 * num_beams);

            let mut next_beams = Vec::with_capacity(num_beams);
            for (rank, (score, beam_idx, token)) in candidates.into_iter().enumerate() {
                if score == f32::NEG_INFINITY {
                    break;
                }
                let mut tokens = state.beams[beam_idx].0.clone();
                tokens.push(token);
                if Some(token) == ids.eos {
                    // EOS beyond the top num_beams would never have been kept
                    if rank < num_beams {
                        state.add(tokens, score, policy, ids.eos);
                    }
                } else {
                    next_beams.push((tokens, score));
                }
                if next_beams.len() == num_beams {
                    break;
                }
            }

            state.beams = next_beams;
            state.done = state.is_done(policy, cur_len + 1);
        }
        cur_len += 1;
    }

    let mut output = Vec::with_capacity(states.len() * policy.num_return_sequences);
    for mut state in states {
        if !state.done {
            for (tokens, score) in std::mem::take(&mut state.beams) {
                state.add(tokens, score, policy, ids.eos);
            }
        }
        output.extend(
            state
                .finished
                .into_iter()
                .take(policy.num_return_sequences)
                .map(|h| h.tokens),
        );
    }
    Ok(output)
}

fn check_logits(logits: &Array2<f32>, rows: usize) -> PipelineResult<()> {
    if logits.nrows() != rows || logits.ncols() == 0 {
        return Err(PipelineError::inference(format!(
            "Decoder returned logits of shape {:?} for {rows} rows",
            logits.shape()
        )));
    }
    Ok(())
}

/// Apply the penalties shared by every strategy.
fn process_logits(scores: &mut [f32], tokens: &[u32], policy: &GenerationPolicy, eos: Option<u32>) {
    if policy.repetition_penalty != 1.0 {
        let mut seen = tokens.to_vec();
        seen.sort_unstable();
        seen.dedup();
        for t in seen {
            if let Some(s) = scores.get_mut(t as usize) {
                *s = if *s < 0.0 {
                    *s * policy.repetition_penalty
                } else {
                    *s / policy.repetition_penalty
                };
            }
        }
    }

    for t in banned_ngram_tokens(tokens, policy.no_repeat_ngram_size) {
        if let Some(s) = scores.get_mut(t as usize) {
            *s = f32::NEG_INFINITY;
        }
    }

    if tokens.len() < policy.min_length {
        if let Some(s) = eos.and_then(|e| scores.get_mut(e as usize)) {
            *s = f32::NEG_INFINITY;
        }
    }
}

/// Tokens that would complete an n-gram already present in `tokens`.
fn banned_ngram_tokens(tokens: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &tokens[tokens.len() + 1 - n..];
    tokens
        .windows(n)
        .filter(|w| &w[..n - 1] == prefix)
        .map(|w| w[n - 1])
        .collect()
}

fn argmax(scores: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best as u32
}

/// `(index, score)` of the `k` highest scores, best first.
fn top_indices(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .map(|(i, &s)| (i as u32, s))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

fn log_softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return;
    }
    let log_sum = scores.iter().map(|&s| (s - max).exp()).sum::<f32>().ln();
    for s in scores.iter_mut() {
        *s = *s - max - log_sum;
    }
}

fn softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

/// Draw one token after temperature, top-k and top-p filtering.
fn sample(scores: &mut [f32], policy: &GenerationPolicy, rng: &mut StdRng) -> u32 {
    if policy.temperature != 1.0 {
        for s in scores.iter_mut() {
            *s /= policy.temperature;
        }
    }

    if policy.top_k > 0 && policy.top_k < scores.len() {
        let threshold = top_indices(scores, policy.top_k)
            .last()
            .map(|&(_, s)| s)
            .unwrap_or(f32::NEG_INFINITY);
        for s in scores.iter_mut() {
            if *s < threshold {
                *s = f32::NEG_INFINITY;
            }
        }
    }

    softmax_in_place(scores);

    if policy.top_p < 1.0 {
        let mut kept = 0.0;
        let mut keep = vec![false; scores.len()];
        for (i, p) in top_indices(scores, scores.len()) {
            keep[i as usize] = true;
            kept += p;
            if kept >= policy.top_p {
                break;
            }
        }
        for (s, k) in scores.iter_mut().zip(keep) {
            if !k {
                *s = 0.0;
            }
        }
    }

    let total: f32 = scores.iter().sum();
    if !(total > 0.0) {
        return argmax(scores);
    }
    let mut target = rng.gen::<f32>() * total;
    for (i, &p) in scores.iter().enumerate() {
        if p > 0.0 {
            if target < p {
                return i as u32;
            }
            target -= p;
        }
    }
    argmax(scores)
}

fn normalizer(generated_len: usize, length_penalty: f32) -> f32 {
    (generated_len.max(1) as f32).powf(length_penalty)
}

/// Tokens after the start token, not counting a trailing EOS.
fn generated_len(tokens: &[u32], eos: Option<u32>) -> usize {
    let mut len = tokens.len().saturating_sub(1);
    if len > 0 && tokens.last().copied() == eos {
        len -= 1;
    }
    len
}

fn truncate_after_eos(mut seq: Vec<u32>, eos: Option<u32>) -> Vec<u32> {
    if let Some(eos) = eos {
        if let Some(pos) = seq.iter().skip(1).position(|&t| t == eos) {
            seq.truncate(pos + 2);
        }
    }
    seq
}
