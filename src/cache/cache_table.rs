//! Per-request block table.
//!
//! A cache table records which blocks back one request's KV cache and how
//! many tokens are stored. Block `i` holds tokens `[i * block_size,
//! (i + 1) * block_size)`. The table grows on demand and gives everything
//! back when the request finishes.

use tracing::debug;

use crate::cache::block_pool::{BlockId, BlockPool, PoolError};
use crate::cache::global_pool::SharedPool;

/// Blocks owned by one request.
#[derive(Debug)]
pub struct CacheTable {
    /// Pool that supplies the blocks.
    pool: SharedPool,

    /// Tokens per block (cached from the pool).
    block_size: usize,

    /// The pool's shared placeholder block.
    null_block: BlockId,

    /// Ordered block indices covering token positions `[0..num_tokens)`.
    block_table: Vec<BlockId>,

    /// Tokens currently represented.
    num_tokens: usize,
}

impl CacheTable {
    /// Create an empty table drawing from `pool`.
    pub fn new(pool: SharedPool) -> Self {
        let (block_size, null_block) = {
            let guard = pool.lock();
            (guard.pool().block_size(), guard.pool().null_block())
        };
        Self {
            pool,
            block_size,
            null_block,
            block_table: Vec::new(),
            num_tokens: 0,
        }
    }

    /// Make room for `num_new_tokens` more tokens, allocating whole blocks
    /// only when the tail block runs out of slots. A placeholder table is
    /// emptied first so no token lands in the shared null block.
    pub fn prepare_cache(&mut self, num_new_tokens: usize) -> Result<(), PoolError> {
        let pool = self.pool.clone();
        let mut guard = pool.lock();
        self.prepare_in(guard.pool_mut(), num_new_tokens)
    }

    /// Give every held block back to the pool and forget all tokens.
    pub fn release_cache(&mut self) -> Result<(), PoolError> {
        let pool = self.pool.clone();
        let mut guard = pool.lock();
        self.release_in(guard.pool_mut())?;
        Ok(())
    }

    pub(crate) fn prepare_in(
        &mut self,
        pool: &mut BlockPool,
        num_new_tokens: usize,
    ) -> Result<(), PoolError> {
        let remaining = self.remaining_slots();
        if remaining < num_new_tokens {
            let num_new_blocks = (num_new_tokens - remaining).div_ceil(self.block_size);
            let new_blocks = pool.allocate(num_new_blocks)?;
            debug!(
                blocks = ?new_blocks,
                num_new_tokens,
                "Grew cache table"
            );
            if self.is_null() {
                self.block_table.clear();
                self.num_tokens = 0;
            }
            self.block_table.extend(new_blocks);
        }
        self.num_tokens += num_new_tokens;
        Ok(())
    }

    /// Releases held blocks into `pool`. The null block is never released.
    /// Returns the number of blocks returned.
    pub(crate) fn release_in(&mut self, pool: &mut BlockPool) -> Result<usize, PoolError> {
        let held = self.held_blocks();
        pool.release(&held)?;

        if !held.is_empty() {
            debug!(blocks = held.len(), tokens = self.num_tokens, "Released cache table");
        }
        self.block_table.clear();
        self.num_tokens = 0;
        Ok(held.len())
    }

    /// Replace the contents with a single placeholder block.
    pub(crate) fn set_placeholder(&mut self) {
        self.block_table.clear();
        self.block_table.push(self.null_block);
        self.num_tokens = 1;
    }

    /// Blocks this table owns exclusively.
    pub(crate) fn held_blocks(&self) -> Vec<BlockId> {
        self.block_table
            .iter()
            .copied()
            .filter(|&id| id != self.null_block)
            .collect()
    }

    pub fn block_table(&self) -> &[BlockId] {
        &self.block_table
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_blocks(&self) -> usize {
        self.block_table.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Unused token slots in the tail block. The null block has none.
    pub fn remaining_slots(&self) -> usize {
        if self.is_null() {
            return 0;
        }
        (self.block_table.len() * self.block_size).saturating_sub(self.num_tokens)
    }

    /// Whether the table holds only the shared placeholder block.
    pub fn is_null(&self) -> bool {
        self.block_table == [self.null_block]
    }

    pub fn null_block(&self) -> BlockId {
        self.null_block
    }

    /// The block that holds token `pos`.
    pub fn block_for_token(&self, pos: usize) -> Option<BlockId> {
        if pos >= self.num_tokens {
            return None;
        }
        self.block_table.get(pos / self.block_size).copied()
    }

    /// Flat slot index of token `pos` in block-indexed cache memory.
    pub fn slot_for_token(&self, pos: usize) -> Option<usize> {
        self.block_for_token(pos)
            .map(|block| block * self.block_size + pos % self.block_size)
    }

    pub(crate) fn pool(&self) -> &SharedPool {
        &self.pool
    }
}
