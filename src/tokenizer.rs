//! Tokenizer collaborator.
//!
//! The scheduling core only needs id-to-text conversion: decoding generated
//! tokens to detect stop strings and rendering logprob strings. It never
//! encodes.

use std::path::Path;

use crate::error::{Error, Result};

/// Token id to text conversion used by delta computation.
pub trait Tokenizer {
    /// Decode a run of token ids to text.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    /// Text of a single token, if the id is in the vocabulary.
    fn id_to_token(&self, token_id: u32) -> Option<String>;

    /// End-of-sequence token id, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32>;
}

/// Adapter over a HuggingFace `tokenizers` tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
}

impl HfTokenizer {
    /// Wrap a loaded tokenizer, looking up the usual EOS spellings.
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let eos_token_id = inner
            .token_to_id("<|endoftext|>")
            .or_else(|| inner.token_to_id("</s>"))
            .or_else(|| inner.token_to_id("<|im_end|>"));
        Self {
            inner,
            eos_token_id,
        }
    }

    /// Load a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Self::new(inner))
    }
}

impl Tokenizer for HfTokenizer {
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.inner
            .decode(token_ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn id_to_token(&self, token_id: u32) -> Option<String> {
        self.inner.id_to_token(token_id)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

/// Byte-level tokenizer: ids below 256 are bytes, anything else decodes to
/// `<id>`. Useful for simulations and tests.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    eos_token_id: Option<u32>,
}

impl ByteTokenizer {
    /// Create a byte tokenizer with the given EOS id.
    pub fn new(eos_token_id: Option<u32>) -> Self {
        Self { eos_token_id }
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new(Some(0))
    }
}

impl Tokenizer for ByteTokenizer {
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        Ok(token_ids
            .iter()
            .filter(|&&id| Some(id) != self.eos_token_id)
            .filter_map(|&id| self.id_to_token(id))
            .collect())
    }

    fn id_to_token(&self, token_id: u32) -> Option<String> {
        match u8::try_from(token_id) {
            Ok(byte) => Some(char::from(byte).to_string()),
            Err(_) => Some(format!("<{token_id}>")),
        }
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}
