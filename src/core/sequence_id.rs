//! Sequence id allocation.
//!
//! A sequence id names one logical generation sequence inside the resource
//! pools (KV caches) of the Model collaborators. Ids are recycled through a
//! free list so the id space stays dense.
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::sequence_id::SequenceIdAllocator;
//!
//! let mut ids = SequenceIdAllocator::new(2);
//! let a = ids.allocate().unwrap();
//! let b = ids.allocate().unwrap();
//! assert!(ids.allocate().is_err());
//!
//! ids.recycle(a).unwrap();
//! assert_eq!(ids.allocate().unwrap(), a);
//! # let _ = b;
//! ```

use std::collections::HashSet;

use crate::error::{Error, Result};

/// Identifier of a sequence inside the Model collaborators.
pub type SequenceId = u64;

/// Issues and recycles sequence ids.
#[derive(Debug)]
pub struct SequenceIdAllocator {
    /// Ids currently handed out.
    live: HashSet<SequenceId>,
    /// Recycled ids (LIFO).
    free_list: Vec<SequenceId>,
    /// Next never-issued id.
    next_fresh: SequenceId,
    /// Maximum number of simultaneously live ids.
    capacity: usize,
}

impl SequenceIdAllocator {
    /// Create an allocator that allows at most `capacity` live ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            live: HashSet::with_capacity(capacity),
            free_list: Vec::new(),
            next_fresh: 0,
            capacity,
        }
    }

    /// Hand out an id that is not currently live.
    ///
    /// Reuses a recycled id when one is available, otherwise issues the next
    /// fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceIdsExhausted`] when `capacity` ids are live.
    pub fn allocate(&mut self) -> Result<SequenceId> {
        if self.live.len() >= self.capacity {
            tracing::error!(capacity = self.capacity, "sequence id space exhausted");
            return Err(Error::SequenceIdsExhausted {
                capacity: self.capacity,
            });
        }

        let id = match self.free_list.pop() {
            Some(id) => id,
            None => {
                let id = self.next_fresh;
                self.next_fresh += 1;
                id
            }
        };
        self.live.insert(id);
        Ok(id)
    }

    /// Return an id to the free list.
    ///
    /// The caller guarantees that no request state still references `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceIdNotLive`] if `id` was never issued or was
    /// already recycled.
    pub fn recycle(&mut self, id: SequenceId) -> Result<()> {
        if !self.live.remove(&id) {
            tracing::error!(sequence_id = id, "recycling a sequence id that is not live");
            return Err(Error::SequenceIdNotLive(id));
        }
        self.free_list.push(id);
        Ok(())
    }

    /// Whether `id` is currently handed out.
    pub fn is_live(&self, id: SequenceId) -> bool {
        self.live.contains(&id)
    }

    /// Number of live ids.
    pub fn num_live(&self) -> usize {
        self.live.len()
    }

    /// Maximum number of live ids.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_monotonic() {
        let mut ids = SequenceIdAllocator::new(8);
        assert_eq!(ids.allocate().unwrap(), 0);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        assert_eq!(ids.num_live(), 3);
    }

    #[test]
    fn test_recycled_id_is_reused_before_fresh() {
        let mut ids = SequenceIdAllocator::new(8);
        let a = ids.allocate().unwrap();
        let _b = ids.allocate().unwrap();
        ids.recycle(a).unwrap();

        assert!(!ids.is_live(a));
        assert_eq!(ids.allocate().unwrap(), a);
    }

    #[test]
    fn test_double_recycle_fails() {
        let mut ids = SequenceIdAllocator::new(8);
        let a = ids.allocate().unwrap();
        ids.recycle(a).unwrap();

        assert!(matches!(ids.recycle(a), Err(Error::SequenceIdNotLive(id)) if id == a));
        assert!(matches!(ids.recycle(99), Err(Error::SequenceIdNotLive(99))));
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = SequenceIdAllocator::new(1);
        let a = ids.allocate().unwrap();
        assert!(matches!(
            ids.allocate(),
            Err(Error::SequenceIdsExhausted { capacity: 1 })
        ));
        ids.recycle(a).unwrap();
        assert!(ids.allocate().is_ok());
    }
}
