//! Physical block pool for the KV cache.
//!
//! Manages a pre-sized memory region as a pool of fixed-size blocks.
//! The pool does exact free/used accounting and nothing else: no budget,
//! no policy. Allocation always hands out the lowest free indices first so
//! that block placement is deterministic.

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;
use tracing::{debug, trace};

/// Index of a block within the pool.
pub type BlockId = usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Out of KV cache blocks: requested {requested}, only {available} free")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("Invalid release: block {block_id} is not owned by a request")]
    InvalidRelease { block_id: BlockId },

    #[error("Block pool has not been initialized")]
    NotInitialized,

    #[error("Block pool has already been initialized")]
    AlreadyInitialized,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Fixed inventory of KV cache blocks.
#[derive(Debug)]
pub struct BlockPool {
    /// Tokens per block.
    block_size: usize,

    /// Total number of blocks, including the null block.
    total_blocks: usize,

    /// Free block indices, ordered so the lowest index is handed out first.
    free_blocks: BTreeSet<BlockId>,

    /// Block indices owned by a request (and the null block).
    used_blocks: HashSet<BlockId>,

    /// Block withdrawn at construction to back placeholder tables.
    null_block: BlockId,
}

impl BlockPool {
    /// Create a pool of `num_blocks` blocks holding `block_size` tokens each.
    ///
    /// One block is withdrawn immediately and kept as the shared null block,
    /// so the usable capacity is `num_blocks - 1`.
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self, PoolError> {
        if num_blocks == 0 {
            return Err(PoolError::InvalidConfig(
                "num_blocks must be at least 1 (one block is reserved)".to_string(),
            ));
        }
        if block_size == 0 {
            return Err(PoolError::InvalidConfig(
                "block_size must be greater than 0".to_string(),
            ));
        }

        let mut pool = Self {
            block_size,
            total_blocks: num_blocks,
            free_blocks: (0..num_blocks).collect(),
            used_blocks: HashSet::with_capacity(num_blocks),
            null_block: 0,
        };

        debug!("Reserving null block from pool");
        let reserved = pool.allocate(1)?;
        pool.null_block = reserved[0];

        Ok(pool)
    }

    /// Allocate `n` blocks, lowest indices first.
    ///
    /// Fails without touching the pool if fewer than `n` blocks are free.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, PoolError> {
        if !self.can_allocate(n) {
            return Err(PoolError::OutOfBlocks {
                requested: n,
                available: self.free_blocks.len(),
            });
        }

        let mut blocks = Vec::with_capacity(n);
        while blocks.len() < n {
            let Some(id) = self.free_blocks.pop_first() else {
                break;
            };
            self.used_blocks.insert(id);
            blocks.push(id);
        }

        trace!(count = n, free = self.free_blocks.len(), "Allocated blocks");
        Ok(blocks)
    }

    /// Return blocks to the free set.
    ///
    /// Every index is validated before any is moved, so a bad index leaves
    /// the pool untouched.
    pub fn release(&mut self, blocks: &[BlockId]) -> Result<(), PoolError> {
        let mut seen = HashSet::with_capacity(blocks.len());
        for &id in blocks {
            if id == self.null_block || !self.used_blocks.contains(&id) || !seen.insert(id) {
                return Err(PoolError::InvalidRelease { block_id: id });
            }
        }

        for &id in blocks {
            self.used_blocks.remove(&id);
            self.free_blocks.insert(id);
        }

        trace!(
            count = blocks.len(),
            free = self.free_blocks.len(),
            "Released blocks"
        );
        Ok(())
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total blocks, including the null block.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Blocks that requests can ever own.
    pub fn usable_blocks(&self) -> usize {
        self.total_blocks - 1
    }

    /// The shared placeholder block.
    pub fn null_block(&self) -> BlockId {
        self.null_block
    }

    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    /// Used blocks, counting the null block.
    pub fn num_used(&self) -> usize {
        self.used_blocks.len()
    }

    /// Blocks currently owned by requests.
    pub fn num_allocated(&self) -> usize {
        self.used_blocks.len() - 1
    }

    pub fn is_free(&self, id: BlockId) -> bool {
        self.free_blocks.contains(&id)
    }

    pub fn is_used(&self, id: BlockId) -> bool {
        self.used_blocks.contains(&id)
    }

    /// Whether `n` blocks could be allocated right now.
    pub fn can_allocate(&self, n: usize) -> bool {
        self.free_blocks.len() >= n
    }

    /// Fraction of usable blocks owned by requests.
    pub fn utilization(&self) -> f64 {
        if self.usable_blocks() == 0 {
            return 0.0;
        }
        self.num_allocated() as f64 / self.usable_blocks() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_withdraws_null_block() {
        let pool = BlockPool::new(9, 4).unwrap();
        assert_eq!(pool.total_blocks(), 9);
        assert_eq!(pool.usable_blocks(), 8);
        assert_eq!(pool.num_free(), 8);
        assert_eq!(pool.num_used(), 1);
        assert_eq!(pool.num_allocated(), 0);
        assert_eq!(pool.null_block(), 0);
        assert!(pool.is_used(0));
        assert!(!pool.is_free(0));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            BlockPool::new(0, 4),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            BlockPool::new(4, 0),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_allocate_ascending() {
        let mut pool = BlockPool::new(9, 4).unwrap();
        assert_eq!(pool.allocate(3).unwrap(), vec![1, 2, 3]);

        pool.release(&[2]).unwrap();
        // Lowest free index is reused first.
        assert_eq!(pool.allocate(2).unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_allocate_failure_is_atomic() {
        let mut pool = BlockPool::new(4, 4).unwrap();
        pool.allocate(2).unwrap();

        let err = pool.allocate(2).unwrap_err();
        assert_eq!(
            err,
            PoolError::OutOfBlocks {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(pool.num_free(), 1);
        assert_eq!(pool.num_used(), 3);
        assert!(pool.is_free(3));
    }

    #[test]
    fn test_can_allocate_tracks_free_blocks() {
        let mut pool = BlockPool::new(4, 4).unwrap();
        assert!(pool.can_allocate(3));
        assert!(!pool.can_allocate(4));

        pool.allocate(2).unwrap();
        assert!(pool.can_allocate(1));
        assert!(!pool.can_allocate(2));
    }

    #[test]
    fn test_allocate_zero() {
        let mut pool = BlockPool::new(2, 4).unwrap();
        assert!(pool.allocate(0).unwrap().is_empty());
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    fn test_release_validates_before_mutating() {
        let mut pool = BlockPool::new(9, 4).unwrap();
        let blocks = pool.allocate(2).unwrap();

        // Block 7 was never allocated.
        let err = pool.release(&[blocks[0], 7]).unwrap_err();
        assert_eq!(err, PoolError::InvalidRelease { block_id: 7 });
        assert!(pool.is_used(blocks[0]));
        assert_eq!(pool.num_free(), 6);
    }

    #[test]
    fn test_release_rejects_duplicates_and_null_block() {
        let mut pool = BlockPool::new(9, 4).unwrap();
        let blocks = pool.allocate(1).unwrap();

        assert!(pool.release(&[blocks[0], blocks[0]]).is_err());
        assert!(pool.is_used(blocks[0]));

        assert_eq!(
            pool.release(&[pool.null_block()]),
            Err(PoolError::InvalidRelease { block_id: 0 })
        );
    }

    #[test]
    fn test_utilization() {
        let mut pool = BlockPool::new(5, 16).unwrap();
        assert_eq!(pool.utilization(), 0.0);

        pool.allocate(2).unwrap();
        assert!((pool.utilization() - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_single_block_pool_has_no_usable_blocks() {
        let mut pool = BlockPool::new(1, 4).unwrap();
        assert_eq!(pool.usable_blocks(), 0);
        assert_eq!(pool.utilization(), 0.0);
        assert!(pool.allocate(1).is_err());
        assert!(pool.allocate(0).is_ok());
    }
}
