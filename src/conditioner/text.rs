//! Text tokenization and conditioning for TTS.

use crate::modules::linear::{Embedding, ParamInit};
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use sentencepiece::SentencePieceProcessor;
use std::path::{Path, PathBuf};

/// SentencePiece model file name inside a model directory.
pub const SENTENCEPIECE_FILE: &str = "tokenizer.model";
/// Hugging Face tokenizer file name inside a model directory.
pub const HF_TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Debug)]
enum TokenizerImpl {
    SentencePiece(SentencePieceProcessor),
    Hf(Box<tokenizers::Tokenizer>),
}

/// Subword tokenizer for the TTS model.
///
/// Handles text preprocessing (normalization, capitalization, punctuation) and
/// tokenization using either a trained SentencePiece model or a serialized
/// Hugging Face tokenizer. Tokenization holds no state between calls.
#[derive(Debug)]
pub struct TextTokenizer {
    inner: TokenizerImpl,
}

/// Text ready for the language model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    /// Normalized prompt that was encoded.
    pub text: String,
    /// Token IDs of `text`.
    pub tokens: Vec<u32>,
    /// Frames to keep generating after end of sequence is detected.
    pub frames_after_eos: usize,
}

impl TextTokenizer {
    /// Load a SentencePiece model from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let sp = SentencePieceProcessor::open(path)
            .with_context(|| format!("opening sentencepiece model {}", path.display()))?;
        Ok(Self {
            inner: TokenizerImpl::SentencePiece(sp),
        })
    }

    /// Load a Hugging Face `tokenizer.json`.
    pub fn open_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("opening tokenizer {}", path.display()))?;
        Ok(Self {
            inner: TokenizerImpl::Hf(Box::new(tokenizer)),
        })
    }

    /// Locate the tokenizer file of a model directory.
    ///
    /// `tokenizer.model` wins when both files are present.
    pub fn locate(model_dir: impl AsRef<Path>) -> Option<PathBuf> {
        [SENTENCEPIECE_FILE, HF_TOKENIZER_FILE]
            .iter()
            .map(|name| model_dir.as_ref().join(name))
            .find(|path| path.is_file())
    }

    /// Open whichever tokenizer a model directory provides.
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let Some(path) = Self::locate(model_dir) else {
            anyhow::bail!(
                "no {SENTENCEPIECE_FILE} or {HF_TOKENIZER_FILE} in {}",
                model_dir.display()
            );
        };
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::open_json(path)
        } else {
            Self::open(path)
        }
    }

    /// Number of entries in the vocabulary.
    pub fn vocab_size(&self) -> usize {
        match &self.inner {
            TokenizerImpl::SentencePiece(sp) => sp.len(),
            TokenizerImpl::Hf(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    /// Encode text into token IDs.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match &self.inner {
            TokenizerImpl::SentencePiece(sp) => {
                let pieces = sp.encode(text)?;
                Ok(pieces.into_iter().map(|piece| piece.id).collect())
            }
            TokenizerImpl::Hf(tokenizer) => {
                let encoding = tokenizer.encode(text, false).map_err(anyhow::Error::msg)?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    /// Decode token IDs back to text.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match &self.inner {
            TokenizerImpl::SentencePiece(sp) => Ok(sp.decode_piece_ids(ids)?),
            TokenizerImpl::Hf(tokenizer) => tokenizer.decode(ids, true).map_err(anyhow::Error::msg),
        }
    }

    /// Prepare raw text for TTS generation.
    ///
    /// Applies normalization rules:
    /// - Trims whitespace and collapses runs of whitespace and newlines
    /// - Capitalizes the first character
    /// - Adds trailing punctuation if missing
    /// - Pads short prompts for better prosody
    ///
    /// # Returns
    ///
    /// A tuple of (prepared_text, frames_after_eos) where `frames_after_eos` is a
    /// heuristic for how many frames to generate after end-of-sequence detection.
    pub fn prepare_text_prompt(text: &str) -> Result<(String, usize)> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            anyhow::bail!("Text prompt cannot be empty");
        }
        let frames_after_eos_guess = if words.len() <= 4 { 3 } else { 1 };
        let mut text = words.join(" ");

        let mut chars = text.chars();
        if let Some(first) = chars.next() {
            if !first.is_uppercase() {
                text = first.to_uppercase().chain(chars).collect();
            }
        }

        if text.chars().last().is_some_and(char::is_alphanumeric) {
            text.push('.');
        }

        if words.len() < 5 {
            text = "        ".to_string() + &text;
        }

        Ok((text, frames_after_eos_guess))
    }

    /// Normalize and encode a prompt.
    pub fn tokenize(&self, text: &str) -> Result<PreparedText> {
        let (text, frames_after_eos) = Self::prepare_text_prompt(text)?;
        let tokens = self.encode(&text)?;
        if tokens.is_empty() {
            anyhow::bail!("prompt produced no tokens");
        }
        Ok(PreparedText {
            text,
            tokens,
            frames_after_eos,
        })
    }

    /// Tokenize raw bytes, rejecting malformed UTF-8.
    pub fn tokenize_bytes(&self, bytes: &[u8]) -> Result<PreparedText> {
        let text = std::str::from_utf8(bytes).context("text is not valid UTF-8")?;
        self.tokenize(text)
    }
}

/// Lookup-table conditioner that embeds token IDs for the transformer.
///
/// The table has one extra row past the vocabulary, reserved for padding.
#[derive(Debug, Clone)]
pub struct LutConditioner<B: Backend> {
    pub embed: Embedding<B>,
}

impl<B: Backend> LutConditioner<B> {
    /// Create a randomly initialized conditioner for `n_bins` tokens.
    pub fn new(n_bins: usize, dim: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            embed: Embedding::new(init, n_bins + 1, dim, device),
        }
    }

    /// Rows in the embedding table.
    pub fn rows(&self) -> usize {
        self.embed.n_bins()
    }

    /// Embed token IDs into model space, `[1, tokens, dim]`.
    pub fn forward_tokens(&self, tokens: &[u32], device: &B::Device) -> Result<Tensor<B, 3>> {
        if let Some(bad) = tokens.iter().find(|&&id| id as usize >= self.rows()) {
            anyhow::bail!(
                "token id {bad} is outside the embedding table of {} rows",
                self.rows()
            );
        }
        let ids: Vec<i64> = tokens.iter().map(|&id| id as i64).collect();
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [1, tokens.len()]), device);
        Ok(self.embed.forward(ids))
    }
}

impl<B: Backend> Parameterized<B> for LutConditioner<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.embed.visit_params(&param_name(prefix, "embed"), visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use std::fs;

    fn word_level_tokenizer(dir: &Path) -> TextTokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "Hello": 1, "world": 2, ".": 3, ",": 4, "!": 5 },
                "unk_token": "[UNK]"
            }
        });
        let path = dir.join(HF_TOKENIZER_FILE);
        fs::write(&path, json.to_string()).expect("write tokenizer");
        TextTokenizer::from_model_dir(dir).expect("open tokenizer")
    }

    #[test]
    fn prepare_text_prompt_basic() {
        let (text, frames) =
            TextTokenizer::prepare_text_prompt("hello world").expect("valid text prompt");
        assert_eq!(text, "        Hello world.");
        assert_eq!(frames, 3);
    }

    #[test]
    fn prepare_text_prompt_collapses_whitespace() {
        let (text, frames) =
            TextTokenizer::prepare_text_prompt("  one  two\nthree\r\n four five! ").expect("text");
        assert_eq!(text, "One two three four five!");
        assert_eq!(frames, 1);
    }

    #[test]
    fn prepare_text_prompt_rejects_empty() {
        let err = TextTokenizer::prepare_text_prompt("   \n").unwrap_err();
        assert!(err.to_string().contains("Text prompt cannot be empty"));
    }

    #[test]
    fn json_tokenizer_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tokenizer = word_level_tokenizer(dir.path());
        assert_eq!(tokenizer.vocab_size(), 6);

        let first = tokenizer.tokenize("Hello, world!").expect("tokenize");
        let second = tokenizer.tokenize("Hello, world!").expect("tokenize");
        assert_eq!(first, second);
        assert_eq!(first.tokens, vec![1, 4, 2, 5]);
        assert_eq!(first.frames_after_eos, 3);
    }

    #[test]
    fn malformed_utf8_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tokenizer = word_level_tokenizer(dir.path());
        let err = tokenizer.tokenize_bytes(&[0x48, 0xff, 0xfe]).unwrap_err();
        assert!(format!("{err:#}").contains("UTF-8"));
        assert!(tokenizer.tokenize_bytes("Hello".as_bytes()).is_ok());
    }

    #[test]
    fn missing_tokenizer_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(TextTokenizer::locate(dir.path()).is_none());
        assert!(TextTokenizer::from_model_dir(dir.path()).is_err());
    }

    #[test]
    fn conditioner_rejects_out_of_table_ids() {
        let device = NdArrayDevice::default();
        let conditioner =
            LutConditioner::<NdArray<f32>>::new(4, 6, &mut ParamInit::new(0), &device);
        assert_eq!(conditioner.rows(), 5);
        let embedded = conditioner.forward_tokens(&[0, 4], &device).expect("embed");
        assert_eq!(embedded.dims(), [1, 2, 6]);
        assert!(conditioner.forward_tokens(&[5], &device).is_err());
    }
}
