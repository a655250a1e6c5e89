//! Process-wide block pool with a budget counter for admission control.
//!
//! The budget is a second, purely speculative view of pool capacity. The
//! scheduler resets it at the start of every pass and requests reserve
//! against it before any real block is touched. Reservations are carried as
//! [`Reservation`] tokens that only this module can create or credit back.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::cache::block_pool::{BlockPool, PoolError};

/// Blocks provisionally taken from the budget by one request.
///
/// Move-only. Committing real blocks draws the reservation down; whatever is
/// still uncommitted goes back to the budget through
/// [`GlobalPool::release_reservation`], which consumes the token.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    blocks: usize,
    pass: u64,
}

impl Reservation {
    /// Number of blocks held by this reservation.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Scheduling pass the reservation was taken in.
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Convert up to `blocks` reserved blocks into real allocation. Returns
    /// the number drawn from the reservation.
    pub(crate) fn commit(&mut self, blocks: usize) -> usize {
        let committed = blocks.min(self.blocks);
        self.blocks -= committed;
        committed
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }
}

/// A block pool plus the per-pass admission budget.
#[derive(Debug)]
pub struct GlobalPool {
    pool: BlockPool,

    /// Blocks still reservable in the current pass.
    budget_blocks: usize,

    /// Incremented by every budget reset.
    pass: u64,
}

impl GlobalPool {
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self, PoolError> {
        let pool = BlockPool::new(num_blocks, block_size)?;
        let budget_blocks = pool.usable_blocks();
        Ok(Self {
            pool,
            budget_blocks,
            pass: 0,
        })
    }

    /// Refill the budget to the blocks free right now and start a new pass.
    ///
    /// Reservations from earlier passes become void.
    pub fn reset_budget(&mut self) {
        self.budget_blocks = self.pool.num_free();
        self.pass += 1;
        trace!(pass = self.pass, budget = self.budget_blocks, "Budget reset");
    }

    /// Take `blocks` from the budget, or `None` if the budget is short.
    pub fn reserve(&mut self, blocks: usize) -> Option<Reservation> {
        if blocks > self.budget_blocks {
            return None;
        }
        self.budget_blocks -= blocks;
        Some(Reservation {
            blocks,
            pass: self.pass,
        })
    }

    /// Combine two reservations held by the same request.
    ///
    /// A reservation from an earlier pass was already reclaimed by the reset
    /// and contributes nothing.
    pub fn merge_reservations(&self, held: Reservation, fresh: Reservation) -> Reservation {
        let held_blocks = if held.pass == self.pass { held.blocks } else { 0 };
        Reservation {
            blocks: held_blocks + fresh.blocks,
            pass: fresh.pass,
        }
    }

    /// Return the uncommitted part of a reservation. Returns the blocks
    /// credited back.
    pub fn release_reservation(&mut self, reservation: Reservation) -> usize {
        if reservation.pass != self.pass {
            trace!(
                blocks = reservation.blocks,
                taken_in = reservation.pass,
                pass = self.pass,
                "Dropping stale reservation"
            );
            return 0;
        }
        self.credit(reservation.blocks)
    }

    /// Return `blocks` to the budget. The budget never exceeds the pool's
    /// usable capacity. Returns the amount actually credited.
    pub fn credit(&mut self, blocks: usize) -> usize {
        let room = self.pool.usable_blocks() - self.budget_blocks;
        let credited = blocks.min(room);
        self.budget_blocks += credited;
        credited
    }

    pub fn budget_blocks(&self) -> usize {
        self.budget_blocks
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }

    pub fn log_status(&self) {
        debug!(
            budget_blocks = self.budget_blocks,
            free_blocks = self.pool.num_free(),
            pass = self.pass,
            "Memory pool status"
        );
    }
}

/// Handle to the one pool shared by the scheduler and every cache table.
pub type SharedPool = Arc<Mutex<GlobalPool>>;

/// Create a new shared pool.
pub fn new_shared_pool(num_blocks: usize, block_size: usize) -> Result<SharedPool, PoolError> {
    Ok(Arc::new(Mutex::new(GlobalPool::new(num_blocks, block_size)?)))
}

/// Holder for the process's pool, owned by the composition root.
///
/// Enforces "initialized exactly once" without a global static: whoever owns
/// the cell decides which components receive the handle.
#[derive(Debug, Default)]
pub struct PoolCell {
    inner: OnceLock<SharedPool>,
}

impl PoolCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the pool. Fails if the cell already holds one.
    pub fn init(&self, num_blocks: usize, block_size: usize) -> Result<SharedPool, PoolError> {
        if self.inner.get().is_some() {
            return Err(PoolError::AlreadyInitialized);
        }
        let pool = new_shared_pool(num_blocks, block_size)?;
        self.inner
            .set(pool.clone())
            .map_err(|_| PoolError::AlreadyInitialized)?;

        info!(num_blocks, block_size, "Initialized global memory pool");
        Ok(pool)
    }

    /// The initialized pool.
    pub fn instance(&self) -> Result<SharedPool, PoolError> {
        self.inner.get().cloned().ok_or(PoolError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }
}
