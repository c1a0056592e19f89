//! Retry and redelivery policy: the consumer failure ladder.
//!
//! A failing delivery is first retried in-process with exponential backoff.
//! When those retries are exhausted it is redelivered out-of-band after each
//! interval of the redelivery list in turn, every redelivery starting a fresh
//! retry cycle. Once the list is exhausted the message is dead-lettered, or
//! discarded when dead-lettering is off.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// In-process exponential retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub attempts: u32,
    pub min: Duration,
    pub max: Duration,
    /// Growth step: retry `n` waits `min + delta * (2^(n-1) - 1)`.
    pub interval_delta: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn exponential(attempts: u32, min: Duration, max: Duration, interval_delta: Duration) -> Self {
        Self {
            attempts,
            min,
            max,
            interval_delta,
        }
    }

    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// `attempts` retries with no delay between them.
    #[must_use]
    pub fn immediate(attempts: u32) -> Self {
        Self::exponential(attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based), clamped to `[min, max]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32
            .checked_pow(exponent)
            .map_or(u32::MAX, |growth| growth - 1);
        let grown = self
            .interval_delta
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        self.min.saturating_add(grown).min(self.max).max(self.min)
    }

    /// All retry delays in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.attempts).map(|attempt| self.delay_for(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(
            5,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
    }
}

// ---------------------------------------------------------------------------
// RedeliveryPolicy
// ---------------------------------------------------------------------------

/// Out-of-band redelivery after a fixed, ordered list of delays.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    pub intervals: Vec<Duration>,
}

impl RedeliveryPolicy {
    #[must_use]
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// Delay before the next redelivery of a message already redelivered
    /// `redelivery_count` times, or `None` when the list is exhausted.
    #[must_use]
    pub fn delay_for(&self, redelivery_count: u32) -> Option<Duration> {
        usize::try_from(redelivery_count)
            .ok()
            .and_then(|index| self.intervals.get(index))
            .copied()
    }

    #[must_use]
    pub fn max_redeliveries(&self) -> usize {
        self.intervals.len()
    }
}

// ---------------------------------------------------------------------------
// FailureLadder
// ---------------------------------------------------------------------------

/// What to do with a delivery whose in-process retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderStep {
    /// Schedule redelivery number `attempt` after `delay`.
    Redeliver { delay: Duration, attempt: u32 },
    DeadLetter,
    Discard,
}

/// Retry, then redelivery, then dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLadder {
    pub retry: RetryPolicy,
    pub redelivery: RedeliveryPolicy,
    pub dead_letter: bool,
}

impl FailureLadder {
    #[must_use]
    pub fn new(retry: RetryPolicy, redelivery: RedeliveryPolicy, dead_letter: bool) -> Self {
        Self {
            retry,
            redelivery,
            dead_letter,
        }
    }

    /// Next step for a message that has been redelivered `redelivery_count` times.
    #[must_use]
    pub fn next_step(&self, redelivery_count: u32) -> LadderStep {
        match self.redelivery.delay_for(redelivery_count) {
            Some(delay) => LadderStep::Redeliver {
                delay,
                attempt: redelivery_count.saturating_add(1),
            },
            None if self.dead_letter => LadderStep::DeadLetter,
            None => LadderStep::Discard,
        }
    }
}
