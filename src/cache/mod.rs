//! KV cache block management.
//!
//! This module contains the allocator and its admission-control layer:
//! - [`block_pool`]: BlockPool, exact free/used accounting of fixed-size blocks
//! - [`global_pool`]: GlobalPool, the shared pool plus per-pass budget
//! - [`cache_table`]: CacheTable, the blocks owned by one request
//! - [`serving`]: ServingCacheTable, budget reservations and the null block

pub mod block_pool;
pub mod cache_table;
pub mod global_pool;
pub mod serving;

pub use block_pool::{BlockId, BlockPool, PoolError};
pub use cache_table::CacheTable;
pub use global_pool::{new_shared_pool, GlobalPool, PoolCell, Reservation, SharedPool};
pub use serving::ServingCacheTable;
