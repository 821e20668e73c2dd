//! Retry decisions with configurable backoff and jitter.
//!
//! The policy is a pure function of the error kind and the attempt count.
//! It knows nothing about deadlines; the executor decides whether a backoff
//! still fits into the remaining budget.

use crate::stages::{StageError, StageErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(n - 1)
    #[default]
    Exponential,
    /// delay = base * n
    Linear,
    /// delay = base
    Constant,
}

/// Retry policy configuration.
///
/// `n` in the backoff formulas is the number of attempts made so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds, applied before jitter.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Relative jitter applied to each delay, e.g. 0.2 for ±20%.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_ratio: 0.2,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub should_retry: bool,
    /// How long to wait before it.
    pub delay: Duration,
}

impl RetryDecision {
    /// Retry after `delay`.
    #[must_use]
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    /// Do not retry.
    #[must_use]
    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter ratio; clamped to `0.0..=1.0` when applied.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Decides whether to retry after a failed attempt.
    #[must_use]
    pub fn decide(&self, error: &StageError, attempts_so_far: u32, max_attempts: u32) -> RetryDecision {
        if attempts_so_far >= max_attempts {
            return RetryDecision::give_up();
        }

        match error.kind {
            StageErrorKind::Permanent => RetryDecision::give_up(),
            StageErrorKind::Timeout => RetryDecision::retry_after(Duration::ZERO),
            StageErrorKind::Transient | StageErrorKind::ResourceUnavailable => {
                RetryDecision::retry_after(self.jittered(self.backoff_ms(attempts_so_far)))
            }
        }
    }

    /// Capped backoff before jitter, in milliseconds.
    #[must_use]
    pub fn backoff_ms(&self, attempts_so_far: u32) -> u64 {
        let n = attempts_so_far.max(1);
        let base = self.base_delay_ms;
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(n - 1))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }

    fn jittered(&self, delay_ms: u64) -> Duration {
        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if delay_ms == 0 || ratio <= 0.0 {
            return Duration::from_millis(delay_ms);
        }

        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        #[allow(clippy::cast_precision_loss)]
        let millis = delay_ms as f64 * factor;
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new().with_jitter_ratio(0.0)
    }

    #[test]
    fn test_backoff_strategy_default() {
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::Exponential);
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 8000);
        assert!((policy.jitter_ratio - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_permanent_never_retried() {
        let decision = RetryPolicy::default().decide(&StageError::permanent("bad"), 1, 3);
        assert_eq!(decision, RetryDecision::give_up());
    }

    #[test]
    fn test_timeout_retried_without_delay() {
        let policy = RetryPolicy::default();
        let err = StageError::timeout("slow");

        assert_eq!(policy.decide(&err, 1, 3), RetryDecision::retry_after(Duration::ZERO));
        assert_eq!(policy.decide(&err, 3, 3), RetryDecision::give_up());
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_ms(1), 1000);
        assert_eq!(policy.backoff_ms(2), 2000);
        assert_eq!(policy.backoff_ms(3), 4000);
        assert_eq!(policy.backoff_ms(4), 8000);
        assert_eq!(policy.backoff_ms(10), 8000);
        assert_eq!(policy.backoff_ms(u32::MAX), 8000);
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = no_jitter()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.backoff_ms(1), 100);
        assert_eq!(linear.backoff_ms(3), 300);

        let constant = no_jitter()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.backoff_ms(1), 100);
        assert_eq!(constant.backoff_ms(7), 100);
    }

    #[test]
    fn test_transient_and_resource_unavailable_back_off() {
        let policy = no_jitter().with_base_delay_ms(10);

        let decision = policy.decide(&StageError::transient("503"), 2, 3);
        assert_eq!(decision, RetryDecision::retry_after(Duration::from_millis(20)));

        let decision = policy.decide(&StageError::resource_unavailable("worker down"), 1, 3);
        assert_eq!(decision, RetryDecision::retry_after(Duration::from_millis(10)));

        let decision = policy.decide(&StageError::transient("503"), 3, 3);
        assert!(!decision.should_retry);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let decision = policy.decide(&StageError::transient("flaky"), 1, 3);
            assert!(decision.should_retry);
            assert!(decision.delay >= Duration::from_millis(799));
            assert!(decision.delay <= Duration::from_millis(1201));
        }
    }

    #[test]
    fn test_deserialize_partial_policy() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"base_delay_ms": 50, "backoff_strategy": "linear"}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 50);
        assert_eq!(policy.max_delay_ms, 8000);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
    }
}
