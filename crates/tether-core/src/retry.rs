use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter and a bounded number of attempts, used to
/// re-establish change feeds that dropped after going live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is zero-based.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Deterministic upper bound for an attempt.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Equal jitter: half the ceiling plus a uniform share of the other half.
    /// A retry hint is a floor.
    pub fn jittered_delay<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
        rng: &mut R,
    ) -> Duration {
        let ceiling = self.delay_for_attempt(attempt, None).as_millis() as u64;
        let half = ceiling / 2;
        let jittered = half + rng.random_range(0..=ceiling - half);
        let hinted = retry_after_hint_ms.unwrap_or(0).min(self.max_delay_ms);
        Duration::from_millis(jittered.max(hinted))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 8)
    }
}
