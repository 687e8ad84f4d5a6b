//! Model collaborators.
//!
//! The scheduling core drives models only through the [`Model`] trait:
//! registering and releasing sequences in the model's KV resource pool and
//! running a forward pass that yields the next sampled token.

pub mod paged;

pub use paged::PagedKvModel;

use crate::core::data::InputChunk;
use crate::core::request::SampleResult;
use crate::core::sequence_id::SequenceId;
use crate::error::Result;

/// A model replica owning a KV-cache-like resource pool.
pub trait Model {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Register a new sequence in the resource pool.
    fn add_sequence(&mut self, seq_id: SequenceId) -> Result<()>;

    /// Release every resource tied to `seq_id`.
    ///
    /// Not idempotent: removing an unknown or already removed sequence is an
    /// error.
    fn remove_sequence(&mut self, seq_id: SequenceId) -> Result<()>;

    /// Feed `inputs` to the sequence and sample the next token.
    fn forward(&mut self, seq_id: SequenceId, inputs: &[InputChunk]) -> Result<SampleResult>;

    /// Whether new sequences of the given lengths fit together.
    fn can_fit(&self, _seq_lens: &[usize]) -> bool {
        true
    }

    /// Whether `seq_id` can grow by `num_tokens` positions.
    fn can_grow(&self, _seq_id: SequenceId, _num_tokens: usize) -> bool {
        true
    }

    /// Whether every sequence in `seq_ids` can decode one more token at once.
    fn can_decode(&self, seq_ids: &[SequenceId]) -> bool {
        seq_ids.iter().all(|&id| self.can_grow(id, 1))
    }
}

/// Release `seq_id` from every model.
pub fn remove_sequence_from_models(models: &mut [Box<dyn Model>], seq_id: SequenceId) -> Result<()> {
    for model in models.iter_mut() {
        if let Err(e) = model.remove_sequence(seq_id) {
            tracing::error!(model = model.name(), sequence_id = seq_id, error = %e, "failed to remove sequence");
            return Err(e);
        }
    }
    Ok(())
}
