//! nano-serve: the request scheduling and lifecycle core of a
//! continuous-batching LLM serving engine.
//!
//! This crate tracks requests from admission to reclamation:
//! - Sequence id allocation over a shared KV resource pool
//! - Per-request, per-model token bookkeeping and streaming deltas
//! - Post-step finish detection, streaming and reclamation
//! - Preemption of running requests back to the waiting queue
//!
//! Models and tokenizers are collaborators behind the [`Model`] and
//! [`Tokenizer`] traits; [`LLMEngine`] is a reference step loop over them.

pub mod config;
pub mod error;
pub mod logging;
pub mod trace;

pub mod core;
pub mod engine;
pub mod model;
pub mod scheduler;
pub mod tokenizer;

pub use config::{EngineConfig, GenerationConfig};
pub use crate::core::data::InputChunk;
pub use crate::core::request::{
    FinishReason, Request, RequestId, RequestModelState, RequestState, ReturnDelta, SampleResult,
};
pub use crate::core::sequence_id::{SequenceId, SequenceIdAllocator};
pub use engine::{GenerationRequest, LLMEngine, StepKind, StepOutput};
pub use error::{Error, Result};
pub use model::{Model, PagedKvModel};
pub use scheduler::{
    preempt_last_running, process_step, reclaim_finished, EngineState, EngineStats,
    RequestStreamOutput,
};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
pub use trace::{EventTraceLog, EventTraceRecorder};
