//! Idempotency claim stores.
//!
//! - [`MemoryIdempotencyStore`]: single-process store on a [`dashmap::DashMap`]
//! - [`StoreSweeper`]: background runnable purging expired claims
//!
//! Multi-node deployments need a shared store implementing
//! [`IdempotencyStore`](crate::traits::IdempotencyStore) with the same contract.

pub mod memory;
pub mod sweeper;

pub use memory::MemoryIdempotencyStore;
pub use sweeper::{StoreSweeper, SweepTask};
