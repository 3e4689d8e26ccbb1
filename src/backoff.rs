//! Retry backoff strategies.
//!
//! A [`BackoffStrategy`] maps the retry attempt number (starting at 1 for the
//! first retry) to the time a worker waits before invoking the handler again.

use std::fmt::Debug;
use std::time::Duration;

/// Policy deciding how long to wait before a retry.
pub trait BackoffStrategy: Debug + Send + Sync {
    /// Delay before retry number `attempt`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Constant delay regardless of attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    /// Delay applied before every retry
    pub delay: Duration,
}

impl FixedBackoff {
    /// Create a fixed backoff
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `base << attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Base delay, doubled for every attempt
    pub base: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    /// Create an exponential backoff
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        // Overflowing shifts or products clamp to the cap instead of wrapping.
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Immediate retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}
