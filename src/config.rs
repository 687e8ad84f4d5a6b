//! Configuration types for nano-serve.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of requests in the running queue.
    pub max_num_seqs: usize,
    /// Maximum total length (prompt + generated) of a single sequence.
    pub max_single_sequence_length: usize,
    /// Size of the sequence id space shared by all Model collaborators.
    pub max_sequence_ids: usize,
    /// Block size for the paged KV model (tokens per block).
    pub block_size: usize,
    /// Total number of blocks for the paged KV model.
    pub num_blocks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_single_sequence_length: 4096,
            max_sequence_ids: 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a JSON string. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be positive".into()));
        }
        if self.max_single_sequence_length == 0 {
            return Err(Error::Config(
                "max_single_sequence_length must be positive".into(),
            ));
        }
        if self.max_sequence_ids < self.max_num_seqs {
            return Err(Error::Config(format!(
                "max_sequence_ids ({}) must be at least max_num_seqs ({})",
                self.max_sequence_ids, self.max_num_seqs
            )));
        }
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(Error::Config("KV block size and count must be positive".into()));
        }
        Ok(())
    }
}

/// Per-request generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Temperature for the sampling collaborator (1.0 = no change).
    pub temperature: f32,
    /// Top-p for the sampling collaborator (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Token ids that end generation when committed.
    pub stop_token_ids: Vec<u32>,
    /// Strings that end generation when they appear in the decoded output.
    pub stop_strs: Vec<String>,
    /// Keep generating past the tokenizer's end-of-sequence token.
    pub ignore_eos: bool,
    /// Number of top alternatives reported per token (0 = no logprobs).
    pub logprobs: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
            stop_strs: Vec::new(),
            ignore_eos: false,
            logprobs: 0,
        }
    }
}

impl GenerationConfig {
    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Add a stop token id.
    pub fn stop_token(mut self, token_id: u32) -> Self {
        self.stop_token_ids.push(token_id);
        self
    }

    /// Add a stop string.
    pub fn stop_str(mut self, stop: impl Into<String>) -> Self {
        self.stop_strs.push(stop.into());
        self
    }

    /// Set the number of logprob alternatives to report.
    pub fn logprobs(mut self, top_n: usize) -> Self {
        self.logprobs = top_n;
        self
    }

    /// Ignore the end-of-sequence token.
    pub fn ignore_eos(mut self, ignore: bool) -> Self {
        self.ignore_eos = ignore;
        self
    }
}
