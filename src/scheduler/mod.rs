//! Scheduling driver for the block allocator.
//!
//! - [`batch`]: first-come-first-served batch planner that gates admission
//!   on budget reservations and commits cache growth after execution

pub mod batch;
