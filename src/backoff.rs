//! Reconnect backoff policy.
//!
//! DESIGN
//! ======
//! Attempt `n` (1-based) waits `base * 2^(n-1)`, capped at `max_delay`, then
//! scaled by a uniform jitter factor in `[1 - jitter, 1 + jitter]`. The jitter
//! sample is injectable so tests can pin the exact delay.
//!
//! TRADE-OFFS
//! ==========
//! Jitter is applied after the cap, so a delay may exceed `max_delay` by at
//! most `jitter * max_delay`. Keeping the cap pre-jitter avoids every client in
//! a fleet converging on exactly `max_delay` after a long outage.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 2_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.2;

/// Exponential backoff parameters for the session's reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Number of reconnect attempts before the session gives up.
    pub max_attempts: u32,
    /// Relative jitter in `[0, 1)`; `0.2` means ±20%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt`, with random jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 { rand::rng().random_range(-1.0..=1.0) } else { 0.0 };
        self.delay_with_sample(attempt, sample)
    }

    /// Delay before reconnect attempt `attempt` for a jitter sample in `[-1, 1]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1_u32 << exponent);
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = (1.0 + self.jitter * sample.clamp(-1.0, 1.0)).max(0.0);
        let millis = (capped.as_millis() as f64 * factor).round();
        Duration::from_millis(millis as u64)
    }

    /// Whether `attempt` is still within the retry budget.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
