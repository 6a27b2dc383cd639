//! Backoff computation and retry scheduling.
//!
//! Decides, after each retryable outcome, whether an envelope gets another
//! attempt and when it becomes due again. Delays grow monotonically with the
//! attempt count, are capped, and carry jitter so envelopes failing together
//! do not all come due in the same instant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for envelopes whose handler reported a transient failure.
///
/// A single default policy applies engine-wide; individual event types can
/// override the attempt ceiling through the dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of handler attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) randomizing each delay.
    pub jitter_factor: f64,

    /// Strategy for growing the delay across attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts.
    Fixed,
    /// Delay grows by the base amount each attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given time.
    Retry {
        /// When the envelope becomes due again.
        next_attempt_at: DateTime<Utc>,
    },
    /// No further attempts; the envelope is permanently failed.
    GiveUp {
        /// Why no retry is scheduled.
        reason: String,
    },
}

/// Computes retry decisions from a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
}

impl RetrySchedule {
    /// Creates a schedule from the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Decides whether an envelope gets another attempt.
    ///
    /// `attempts` is the count after the failed attempt was recorded. A
    /// `delay_hint` from the handler overrides the computed backoff for this
    /// single attempt; handlers know more about the transient cause, such as
    /// a rate-limit reset. The returned retry time is strictly later than
    /// `now`.
    pub fn decide(
        &self,
        attempts: u32,
        delay_hint: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.policy.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempts, delay_hint);
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: now + delay }
    }

    /// Calculates the delay before the next attempt.
    fn calculate_delay(&self, attempts: u32, delay_hint: Option<Duration>) -> Duration {
        if let Some(hint) = delay_hint {
            return hint.max(MIN_DELAY);
        }

        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay * attempts.max(1),
            BackoffStrategy::Exponential => {
                let exponent = attempts.saturating_sub(1).min(20);
                self.policy.base_delay * 2_u32.saturating_pow(exponent)
            },
        };

        let capped = std::cmp::min(base_delay, self.policy.max_delay);
        let jittered = apply_jitter(capped, self.policy.jitter_factor);

        std::cmp::min(jittered, self.policy.max_delay).max(MIN_DELAY)
    }
}

/// Floor on computed delays so the retry time is strictly in the future.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Randomizes a delay by plus or minus `jitter_factor` percent.
///
/// With `jitter_factor=0.25` a 10s delay lands between 7.5s and 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
