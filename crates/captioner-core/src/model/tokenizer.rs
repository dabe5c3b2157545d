//! Byte-level BPE tokenizer built from `vocab.json` + `merges.txt`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::{AddedToken, Tokenizer};

use crate::error::{ArtifactError, PipelineError};

/// A special token as written in `tokenizer_config.json`: either a plain
/// string or an `AddedToken` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    pub fn content(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

/// Contents of `tokenizer_config.json`.
///
/// Unrecognized keys (`tokenizer_class`, `errors`, ...) are collected in
/// `extra` and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub bos_token: Option<SpecialToken>,
    pub eos_token: Option<SpecialToken>,
    pub unk_token: Option<SpecialToken>,
    pub pad_token: Option<SpecialToken>,
    pub add_prefix_space: bool,
    /// Remove the space BPE leaves before punctuation and contractions
    pub clean_up_tokenization_spaces: bool,
    pub model_max_length: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        let endoftext = || Some(SpecialToken::Plain("<|endoftext|>".to_string()));
        Self {
            bos_token: endoftext(),
            eos_token: endoftext(),
            unk_token: endoftext(),
            pad_token: None,
            add_prefix_space: false,
            clean_up_tokenization_spaces: true,
            model_max_length: Some(1024),
            extra: Map::new(),
        }
    }
}

impl TokenizerConfig {
    fn special_tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = [
            &self.bos_token,
            &self.eos_token,
            &self.unk_token,
            &self.pad_token,
        ]
        .into_iter()
        .flatten()
        .map(SpecialToken::content)
        .collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens
    }
}

/// Maps between text and token ids.
pub struct CaptionTokenizer {
    inner: Tokenizer,
    config: TokenizerConfig,
}

impl CaptionTokenizer {
    /// Build a GPT-2 style tokenizer from vocabulary and merge files.
    pub fn from_files(
        vocab_path: &Path,
        merges_path: &Path,
        config: TokenizerConfig,
    ) -> Result<Self, ArtifactError> {
        for path in [vocab_path, merges_path] {
            if !path.exists() {
                return Err(ArtifactError::Missing(path.to_path_buf()));
            }
        }
        let vocab = utf8_path(vocab_path)?;
        let merges = utf8_path(merges_path)?;

        let mut builder = BPE::from_file(vocab, merges);
        if let Some(unk) = &config.unk_token {
            builder = builder.unk_token(unk.content().to_string());
        }
        let bpe = builder.build().map_err(|e| ArtifactError::Load {
            path: vocab_path.to_path_buf(),
            message: format!("Failed to build BPE model: {e}"),
        })?;

        let mut inner = Tokenizer::new(bpe);
        inner
            .with_pre_tokenizer(Some(
                ByteLevel::default().add_prefix_space(config.add_prefix_space),
            ))
            .with_decoder(Some(ByteLevel::default()));

        let special: Vec<AddedToken> = config
            .special_tokens()
            .into_iter()
            .map(|t| AddedToken::from(t.to_string(), true))
            .collect();
        inner.add_special_tokens(&special);

        tracing::debug!(
            "Loaded tokenizer from {:?} (vocab size: {}, special: {:?})",
            vocab_path,
            inner.get_vocab_size(true),
            config.special_tokens()
        );

        Ok(Self { inner, config })
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    /// Vocabulary size including added special tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.config
            .eos_token
            .as_ref()
            .and_then(|t| self.token_to_id(t.content()))
    }

    /// Encode text to token ids without adding special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| PipelineError::Decoding {
                message: format!("Tokenization failed: {e}"),
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode one sequence, dropping special tokens and surrounding whitespace.
    pub fn decode(&self, ids: &[u32]) -> Result<String, PipelineError> {
        let text = self
            .inner
            .decode(ids, true)
            .map_err(|e| PipelineError::Decoding {
                message: e.to_string(),
            })?;
        let text = if self.config.clean_up_tokenization_spaces {
            clean_up_tokenization(&text)
        } else {
            text
        };
        Ok(text.trim().to_string())
    }

    /// Decode every sequence, preserving order.
    pub fn decode_batch(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>, PipelineError> {
        sequences.iter().map(|ids| self.decode(ids)).collect()
    }
}

/// Join punctuation and English contractions to the preceding word.
fn clean_up_tokenization(text: &str) -> String {
    const PAIRS: [(&str, &str); 10] = [
        (" .", "."),
        (" ?", "?"),
        (" !", "!"),
        (" ,", ","),
        (" ' ", "'"),
        (" n't", "n't"),
        (" 'm", "'m"),
        (" 's", "'s"),
        (" 've", "'ve"),
        (" 're", "'re"),
    ];
    PAIRS
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

fn utf8_path(path: &Path) -> Result<&str, ArtifactError> {
    path.to_str().ok_or_else(|| ArtifactError::Load {
        path: path.to_path_buf(),
        message: "path is not valid UTF-8".to_string(),
    })
}
