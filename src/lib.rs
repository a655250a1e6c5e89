//! block-budget: KV cache block allocator with budget-based admission control.
//!
//! Each in-flight request owns a growable table of fixed-size blocks. Before a
//! batch is committed the scheduler reserves blocks against a per-pass budget,
//! so admission never promises more memory than the pool can supply.

pub mod cache;
pub mod config;
pub mod scheduler;
