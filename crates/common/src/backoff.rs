//! Bounded exponential backoff.
//!
//! Retry loops in certctl are explicit state machines: a [`Backoff`] counts
//! failed attempts against a [`RetryPolicy`] and either hands out the next
//! delay or reports that the attempt budget is exhausted.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.0 - 1.0).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_millis() as f64 * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (delay.as_millis() as f64 + offset).max(0.0);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(2), Duration::from_secs(60)).with_jitter(0.1)
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait this long, then try again.
    Retry(Duration),
    /// No attempts left.
    Exhausted,
}

/// Attempt counter for one retried operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Record a failed attempt and decide what happens next.
    pub fn record_failure(&mut self) -> BackoffStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            trace!(
                failures = self.failures,
                max_attempts = self.policy.max_attempts,
                "Retry budget exhausted"
            );
            return BackoffStep::Exhausted;
        }
        let delay = self.policy.jittered(self.policy.delay_for_retry(self.failures));
        trace!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        BackoffStep::Retry(delay)
    }

    /// Failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
