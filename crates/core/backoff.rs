//! Retry tiers and their wait queues.
//!
//! A message retried for the `n`th time waits in `<queue>_wait_<n>` for
//! `ttl_base * 4^(n-1)` before it is delivered to `<queue>` again.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Growth factor between consecutive tiers.
pub const GROWTH_FACTOR: u64 = 4;

/// Name of the wait queue for `tier` of `queue`.
pub fn wait_queue_name(queue: &str, tier: u32) -> String {
    format!("{}_wait_{}", queue, tier)
}

/// Backoff schedule derived from `ttl_base` and `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    ttl_base: Duration,
    max_retries: u32,
}

impl Backoff {
    pub fn new(ttl_base: Duration, max_retries: u32) -> Self {
        Self {
            ttl_base,
            max_retries,
        }
    }

    pub fn ttl_base(&self) -> Duration {
        self.ttl_base
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Time a message spends in the wait queue of `tier` (1-indexed).
    ///
    /// Saturates at `u64::MAX` milliseconds.
    pub fn wait_queue_ttl(&self, tier: u32) -> Duration {
        let exponent = tier.saturating_sub(1);
        let base = u64::try_from(self.ttl_base.as_millis()).unwrap_or(u64::MAX);
        let factor = GROWTH_FACTOR.saturating_pow(exponent);
        Duration::from_millis(base.saturating_mul(factor))
    }

    /// Tier of the next retry for a message already retried `repeat_count`
    /// times, or `None` once the budget is spent.
    pub fn next_tier(&self, repeat_count: u32) -> Option<u32> {
        let tier = repeat_count.checked_add(1)?;
        (tier <= self.max_retries).then_some(tier)
    }

    /// All tiers that need a wait queue.
    pub fn tiers(&self) -> RangeInclusive<u32> {
        1..=self.max_retries
    }

    /// Wait queue names of `queue`, in tier order.
    pub fn wait_queues(&self, queue: &str) -> Vec<String> {
        self.tiers().map(|tier| wait_queue_name(queue, tier)).collect()
    }
}
