//! Budget-aware cache table used by the serving scheduler.
//!
//! Admission happens in two phases. During scheduling a request calls
//! [`ServingCacheTable::try_reserve_budget`], which only moves the pool's
//! budget counter. Once the batch is fixed, admitted requests commit real
//! blocks with `prepare_cache`, which draws the reservation down; rejected or
//! aborted ones hand the budget back with `release_budget`. Releasing the
//! cache returns both the held blocks and any uncommitted remainder.

use tracing::{debug, trace};

use crate::cache::block_pool::{BlockId, PoolError};
use crate::cache::cache_table::CacheTable;
use crate::cache::global_pool::{Reservation, SharedPool};

/// A [`CacheTable`] plus the request's outstanding budget reservation.
#[derive(Debug)]
pub struct ServingCacheTable {
    table: CacheTable,
    reservation: Option<Reservation>,
}

impl ServingCacheTable {
    pub fn new(pool: SharedPool) -> Self {
        Self {
            table: CacheTable::new(pool),
            reservation: None,
        }
    }

    /// Speculatively reserve budget for `num_new_tokens` more tokens.
    ///
    /// Returns `true` if the tail block already has room or the budget covers
    /// the extra blocks. A `false` leaves both the budget and the physical
    /// pool untouched.
    pub fn try_reserve_budget(&mut self, num_new_tokens: usize) -> bool {
        let remaining = self.table.remaining_slots();
        if num_new_tokens <= remaining {
            return true;
        }

        let required = self.required_blocks(num_new_tokens - remaining);
        let pool = self.table.pool().clone();
        let mut guard = pool.lock();

        let Some(fresh) = guard.reserve(required) else {
            trace!(
                required,
                budget = guard.budget_blocks(),
                "Budget reservation rejected"
            );
            return false;
        };

        let merged = match self.reservation.take() {
            Some(held) => guard.merge_reservations(held, fresh),
            None => fresh,
        };
        trace!(
            required,
            budget_used = merged.blocks(),
            budget = guard.budget_blocks(),
            "Budget reserved"
        );
        self.reservation = Some(merged);
        true
    }

    /// Shrink the table to the shared placeholder block.
    ///
    /// Any real blocks still held are released first, exactly as
    /// [`release_cache`](Self::release_cache) would, and any outstanding
    /// reservation is handed back. The placeholder owns nothing and offers no
    /// tail slots; the next `prepare_cache` replaces it with owned blocks.
    pub fn assign_null_block(&mut self) -> Result<(), PoolError> {
        if self.table.held_blocks().is_empty() {
            self.release_budget();
        } else {
            self.release_cache()?;
        }
        self.table.set_placeholder();
        Ok(())
    }

    /// Blocks needed to hold `num_tokens` tokens.
    pub fn required_blocks(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.table.block_size())
    }

    /// Hand back the outstanding speculative reservation.
    pub fn release_budget(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        let credited = self.table.pool().lock().release_reservation(reservation);
        trace!(credited, "Released budget");
    }

    /// Commit real blocks for `num_new_tokens` more tokens. New blocks are
    /// drawn from the outstanding reservation first.
    pub fn prepare_cache(&mut self, num_new_tokens: usize) -> Result<(), PoolError> {
        let before = self.table.held_blocks().len();
        self.table.prepare_cache(num_new_tokens)?;
        let grown = self.table.held_blocks().len() - before;

        if let Some(reservation) = self.reservation.as_mut() {
            reservation.commit(grown);
            if reservation.is_empty() {
                self.reservation = None;
            }
        }
        Ok(())
    }

    /// Release the committed cache and replenish the budget by the number of
    /// blocks physically held, plus whatever part of the reservation was
    /// never committed.
    pub fn release_cache(&mut self) -> Result<(), PoolError> {
        let pool = self.table.pool().clone();
        let mut guard = pool.lock();

        let held = self.table.held_blocks().len();

        // Validate the physical release before touching the budget.
        self.table.release_in(guard.pool_mut())?;
        let mut credited = guard.credit(held);

        if let Some(reservation) = self.reservation.take() {
            credited += guard.release_reservation(reservation);
        }

        debug!(held, credited, budget = guard.budget_blocks(), "Released serving cache");
        Ok(())
    }

    /// Blocks reserved but not yet committed.
    pub fn budget_used(&self) -> usize {
        self.reservation.as_ref().map_or(0, Reservation::blocks)
    }

    pub fn table(&self) -> &CacheTable {
        &self.table
    }

    pub fn block_table(&self) -> &[BlockId] {
        self.table.block_table()
    }

    pub fn num_tokens(&self) -> usize {
        self.table.num_tokens()
    }

    pub fn num_blocks(&self) -> usize {
        self.table.num_blocks()
    }
}
