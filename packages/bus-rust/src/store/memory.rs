//! In-memory [`IdempotencyStore`] backed by [`DashMap`].
//!
//! Each entry maps a key to the millisecond instant its claim expires. The
//! claim check and the claim write happen under the same shard lock through
//! the entry API, so two racing `try_start` calls cannot both win.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::clock::duration_millis;
use courier_core::{ClockSource, IdempotencyKey, SystemClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::delivery::StoreError;
use crate::traits::IdempotencyStore;

/// Single-process claim ledger.
pub struct MemoryIdempotencyStore {
    claims: DashMap<String, u64>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryIdempotencyStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store on the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            claims: DashMap::new(),
            clock,
        }
    }

    /// Claims `key` for `ttl` unless a live claim exists.
    pub fn claim(&self, key: &str, ttl: Duration) -> bool {
        let now = self.clock.now();
        let expires_at = now.saturating_add(duration_millis(ttl));
        match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return false;
                }
                held.insert(expires_at);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    /// Drops the claim on `key`, if any.
    pub fn release(&self, key: &str) {
        self.claims.remove(key);
    }

    /// Removes every expired claim and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.claims.len();
        self.claims.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.claims.len())
    }

    /// Number of tracked claims, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_start(&self, key: &IdempotencyKey, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.claim(key.as_str(), ttl))
    }

    async fn complete(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        self.release(key.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
