//! Error types for nano-serve.
//!
//! Errors fall into three groups. Consistency violations mean the scheduler's
//! own bookkeeping is corrupt and the step loop must stop. Resource exhaustion
//! means an upstream capacity check let too much through. Everything else
//! (config, tokenizer, io) is ordinary failure at the edges.

use thiserror::Error;

use crate::core::sequence_id::SequenceId;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Every sequence id in the configured id space is live.
    #[error("sequence id space exhausted ({capacity} ids live)")]
    SequenceIdsExhausted { capacity: usize },

    /// A sequence id was recycled while not live (double release).
    #[error("sequence id {0} is not live")]
    SequenceIdNotLive(SequenceId),

    /// A Model collaborator was asked about a sequence it does not hold.
    #[error("sequence {0} not found in model")]
    SequenceNotFound(SequenceId),

    /// A Model collaborator was asked to register a sequence twice.
    #[error("sequence {0} already registered in model")]
    SequenceExists(SequenceId),

    /// Request id has no entry in the engine state.
    #[error("request {0} not found")]
    RequestNotFound(String),

    /// Request id was added twice.
    #[error("request {0} already exists")]
    DuplicateRequest(String),

    /// A request expected in the running queue is absent.
    #[error("request {0} is not in the running queue")]
    NotRunning(String),

    /// Preemption was requested with nothing running.
    #[error("no running request to preempt")]
    NothingToPreempt,

    /// Any other broken scheduler invariant.
    #[error("scheduler invariant violated: {0}")]
    Consistency(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error indicates corrupted scheduler state or a capacity
    /// accounting bug. The step loop must not continue after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfBlocks
                | Self::SequenceIdsExhausted { .. }
                | Self::SequenceIdNotLive(_)
                | Self::SequenceNotFound(_)
                | Self::SequenceExists(_)
                | Self::RequestNotFound(_)
                | Self::NotRunning(_)
                | Self::NothingToPreempt
                | Self::Consistency(_)
        )
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::SequenceIdNotLive(3).is_fatal());
        assert!(Error::NotRunning("r".into()).is_fatal());
        assert!(Error::SequenceIdsExhausted { capacity: 4 }.is_fatal());
        assert!(!Error::Config("bad".into()).is_fatal());
        assert!(!Error::Tokenization("bad".into()).is_fatal());
    }
}
