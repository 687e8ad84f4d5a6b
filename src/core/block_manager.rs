//! Free-list allocator for KV cache blocks.
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(2, 16);
//! let blocks = manager.allocate_many(2).unwrap();
//! assert!(manager.allocate().is_err());
//!
//! manager.free_many(&blocks);
//! assert_eq!(manager.num_free_blocks(), 2);
//! ```

use std::collections::{HashSet, VecDeque};

use crate::error::{Error, Result};

/// Hands out physical block ids from a fixed pool.
#[derive(Debug)]
pub struct BlockManager {
    /// Ids currently allocated.
    used: HashSet<usize>,
    /// Free block ids.
    free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of blocks.
    num_blocks: usize,
}

impl BlockManager {
    /// Create a manager owning `num_blocks` blocks of `block_size` tokens.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            used: HashSet::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            block_size,
            num_blocks,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.used.len()
    }

    /// Check if `num_blocks` blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate a single block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    pub fn allocate(&mut self) -> Result<usize> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        self.used.insert(block_id);
        Ok(block_id)
    }

    /// Allocate `num_blocks` blocks, or none at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if not enough free blocks are available.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfBlocks);
        }
        (0..num_blocks).map(|_| self.allocate()).collect()
    }

    /// Return a block to the free list. Returns `false` if it was not
    /// allocated.
    pub fn free(&mut self, block_id: usize) -> bool {
        if self.used.remove(&block_id) {
            self.free_list.push_back(block_id);
            true
        } else {
            false
        }
    }

    /// Free several blocks, returning how many were actually allocated.
    pub fn free_many(&mut self, block_ids: &[usize]) -> usize {
        block_ids.iter().filter(|&&id| self.free(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut manager = BlockManager::new(10, 16);

        let block_id = manager.allocate().unwrap();
        assert_eq!(manager.num_free_blocks(), 9);
        assert_eq!(manager.num_used_blocks(), 1);

        assert!(manager.free(block_id));
        assert!(!manager.free(block_id));
        assert_eq!(manager.num_free_blocks(), 10);
    }

    #[test]
    fn test_allocate_many_is_all_or_nothing() {
        let mut manager = BlockManager::new(5, 16);
        manager.allocate_many(3).unwrap();

        assert!(matches!(manager.allocate_many(3), Err(Error::OutOfBlocks)));
        assert_eq!(manager.num_free_blocks(), 2);
    }
}
