//! Request input chunks.
//!
//! A request's input is an ordered list of chunks. Plain-token chunks feed
//! token ids straight to the embedding; other chunks (images and the like)
//! carry a precomputed embedding length and need their own encoder pass.

use serde::{Deserialize, Serialize};

/// One chunk of request input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputChunk {
    /// Plain token ids.
    Tokens(Vec<u32>),
    /// Non-token data occupying `length` positions once embedded.
    Embedding {
        /// Kind of data, e.g. "image".
        kind: String,
        /// Number of sequence positions the embedding occupies.
        length: usize,
    },
}

impl InputChunk {
    /// Token ids if this is a plain-token chunk.
    pub fn as_token_ids(&self) -> Option<&[u32]> {
        match self {
            Self::Tokens(ids) => Some(ids),
            Self::Embedding { .. } => None,
        }
    }

    /// Mutable token ids if this is a plain-token chunk.
    pub fn as_token_ids_mut(&mut self) -> Option<&mut Vec<u32>> {
        match self {
            Self::Tokens(ids) => Some(ids),
            Self::Embedding { .. } => None,
        }
    }

    /// Number of sequence positions this chunk occupies.
    pub fn len(&self) -> usize {
        match self {
            Self::Tokens(ids) => ids.len(),
            Self::Embedding { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Total number of sequence positions across `chunks`.
pub fn total_length(chunks: &[InputChunk]) -> usize {
    chunks.iter().map(InputChunk::len).sum()
}
