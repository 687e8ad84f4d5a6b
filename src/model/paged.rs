//! Paged KV model.
//!
//! A [`Model`] whose resource pool is a [`BlockManager`]: every sequence owns
//! a [`BlockTable`] that grows as positions are written. Token selection is
//! delegated to a generator closure that sees the full token context of the
//! sequence, so the same context always yields the same continuation.

use std::collections::HashMap;

use crate::core::block::{compute_num_blocks, BlockTable};
use crate::core::block_manager::BlockManager;
use crate::core::data::{total_length, InputChunk};
use crate::core::request::SampleResult;
use crate::core::sequence_id::SequenceId;
use crate::error::{Error, Result};
use crate::model::Model;

/// Picks the next token given the token context of a sequence.
pub type NextTokenFn = Box<dyn FnMut(&[u32]) -> SampleResult>;

struct PagedSequence {
    table: BlockTable,
    /// Token ids written so far (embedding chunks contribute no ids).
    context: Vec<u32>,
}

/// Block-accounted model collaborator.
pub struct PagedKvModel {
    name: String,
    block_manager: BlockManager,
    sequences: HashMap<SequenceId, PagedSequence>,
    next_token: NextTokenFn,
}

impl PagedKvModel {
    /// Create a model with `num_blocks` blocks of `block_size` tokens.
    pub fn new(
        name: impl Into<String>,
        num_blocks: usize,
        block_size: usize,
        next_token: NextTokenFn,
    ) -> Self {
        Self {
            name: name.into(),
            block_manager: BlockManager::new(num_blocks, block_size),
            sequences: HashMap::new(),
            next_token,
        }
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_manager.num_free_blocks()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn contains_sequence(&self, seq_id: SequenceId) -> bool {
        self.sequences.contains_key(&seq_id)
    }

    /// Token context written for `seq_id`.
    pub fn context(&self, seq_id: SequenceId) -> Option<&[u32]> {
        self.sequences.get(&seq_id).map(|s| s.context.as_slice())
    }
}

impl Model for PagedKvModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_sequence(&mut self, seq_id: SequenceId) -> Result<()> {
        if self.sequences.contains_key(&seq_id) {
            return Err(Error::SequenceExists(seq_id));
        }
        let table = BlockTable::new(self.block_manager.block_size());
        self.sequences.insert(
            seq_id,
            PagedSequence {
                table,
                context: Vec::new(),
            },
        );
        Ok(())
    }

    fn remove_sequence(&mut self, seq_id: SequenceId) -> Result<()> {
        let mut seq = self
            .sequences
            .remove(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        let blocks = seq.table.take_blocks();
        self.block_manager.free_many(&blocks);
        tracing::trace!(model = %self.name, sequence_id = seq_id, freed_blocks = blocks.len(), "sequence removed");
        Ok(())
    }

    fn forward(&mut self, seq_id: SequenceId, inputs: &[InputChunk]) -> Result<SampleResult> {
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;

        let num_tokens = total_length(inputs);
        let new_blocks = self
            .block_manager
            .allocate_many(seq.table.blocks_needed_for(num_tokens))?;
        for block_id in new_blocks {
            seq.table.append_block(block_id);
        }
        seq.table.advance(num_tokens);

        for chunk in inputs {
            if let Some(ids) = chunk.as_token_ids() {
                seq.context.extend_from_slice(ids);
            }
        }
        Ok((self.next_token)(&seq.context))
    }

    fn can_fit(&self, seq_lens: &[usize]) -> bool {
        let block_size = self.block_manager.block_size();
        let needed = seq_lens.iter().map(|&len| compute_num_blocks(len, block_size)).sum();
        self.block_manager.can_allocate(needed)
    }

    fn can_grow(&self, seq_id: SequenceId, num_tokens: usize) -> bool {
        self.sequences
            .get(&seq_id)
            .is_some_and(|s| self.block_manager.can_allocate(s.table.blocks_needed_for(num_tokens)))
    }

    fn can_decode(&self, seq_ids: &[SequenceId]) -> bool {
        let mut needed = 0;
        for seq_id in seq_ids {
            match self.sequences.get(seq_id) {
                Some(seq) => needed += seq.table.blocks_needed_for(1),
                None => return false,
            }
        }
        self.block_manager.can_allocate(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_model(num_blocks: usize) -> PagedKvModel {
        PagedKvModel::new(
            "echo",
            num_blocks,
            4,
            Box::new(|ctx: &[u32]| SampleResult::new(ctx.len() as u32, 0.0)),
        )
    }

    #[test]
    fn test_forward_allocates_blocks() {
        let mut model = echo_model(4);
        model.add_sequence(7).unwrap();

        let sample = model.forward(7, &[InputChunk::Tokens(vec![1, 2, 3, 4, 5])]).unwrap();
        assert_eq!(sample.token_id(), 5);
        assert_eq!(model.num_free_blocks(), 2);
        assert!(model.can_grow(7, 3));
        assert!(!model.can_grow(7, 12));
    }

    #[test]
    fn test_can_decode_counts_the_whole_batch() {
        let mut model = echo_model(3);
        for seq_id in [1, 2] {
            model.add_sequence(seq_id).unwrap();
            model.forward(seq_id, &[InputChunk::Tokens(vec![1; 4])]).unwrap();
        }
        // Both sequences sit on a block boundary and need one block each.
        assert!(model.can_grow(1, 1));
        assert!(model.can_grow(2, 1));
        assert!(!model.can_decode(&[1, 2]));
        assert!(model.can_decode(&[1]));
        assert!(!model.can_decode(&[9]));
    }

    #[test]
    fn test_can_fit_rounds_each_sequence() {
        let model = echo_model(3);
        assert!(model.can_fit(&[5]));
        // 5 + 5 positions would fit 3 blocks if packed, but each sequence
        // needs 2 blocks of its own.
        assert!(!model.can_fit(&[5, 5]));
        assert!(model.can_fit(&[4, 4, 4]));
    }

    #[test]
    fn test_remove_twice_is_an_error() {
        let mut model = echo_model(4);
        model.add_sequence(1).unwrap();
        model.forward(1, &[InputChunk::Tokens(vec![1; 6])]).unwrap();

        model.remove_sequence(1).unwrap();
        assert_eq!(model.num_free_blocks(), 4);
        assert!(matches!(model.remove_sequence(1), Err(Error::SequenceNotFound(1))));
    }

    #[test]
    fn test_out_of_blocks() {
        let mut model = echo_model(1);
        model.add_sequence(0).unwrap();
        let result = model.forward(0, &[InputChunk::Tokens(vec![1; 5])]);
        assert!(matches!(result, Err(Error::OutOfBlocks)));
    }
}
