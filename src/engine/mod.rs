//! Inference engine.
//!
//! This module contains:
//! - LLMEngine, a reference step loop over the scheduling core
//! - GenerationRequest builders

pub mod llm;

pub use llm::{GenerationRequest, LLMEngine, StepKind, StepOutput};
