//! Block tables for the paged KV model.
//!
//! The KV cache is split into fixed-size blocks. Each live sequence owns a
//! table mapping its logical block index to a physical block id, so the
//! space a sequence occupies grows one block at a time.

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Maps a sequence's logical blocks to physical block ids.
///
/// Token at position `p` lives in physical block `block_ids[p / block_size]`.
///
/// # Example
///
/// ```
/// use nano_serve::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);
/// table.append_block(12);
///
/// assert_eq!(table.capacity_tokens(), 32);
/// assert_eq!(table.physical_block_ids(), &[5, 12]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block ids in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Sequence positions written so far.
    num_tokens: usize,
}

impl BlockTable {
    /// Create an empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
            num_tokens: 0,
        }
    }

    /// Add a physical block at the end of the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks held.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Physical block ids in logical order.
    pub fn physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Positions the held blocks can store.
    pub fn capacity_tokens(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Positions written so far.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Blocks still needed to hold `additional` more positions.
    pub fn blocks_needed_for(&self, additional: usize) -> usize {
        compute_num_blocks(self.num_tokens + additional, self.block_size)
            .saturating_sub(self.block_ids.len())
    }

    pub(crate) fn advance(&mut self, num_tokens: usize) {
        self.num_tokens += num_tokens;
    }

    /// Drop all blocks, returning their ids.
    pub fn take_blocks(&mut self) -> Vec<usize> {
        self.num_tokens = 0;
        std::mem::take(&mut self.block_ids)
    }
}

/// Number of blocks needed for `seq_len` tokens.
///
/// ```
/// use nano_serve::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
