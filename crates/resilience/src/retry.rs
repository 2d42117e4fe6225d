//! Bounded exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::step_result::StepResult;

/// Retry tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed call; doubled after each further failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay (0.0..=1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

/// Re-runs transiently failing operations with exponential backoff.
///
/// Only [`StepResult::TransientError`] is retried. `PermanentError` and
/// `CircuitOpen` are returned as-is without consuming another attempt.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before the next call after `failed_attempts` failed calls.
    ///
    /// `min(base * 2^(failed_attempts - 1), max)` plus jitter, never above `max`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_delay);

        let jittered = if self.policy.jitter_factor > 0.0 {
            let jitter = fastrand::f64() * self.policy.jitter_factor;
            delay.mul_f64(1.0 + jitter)
        } else {
            delay
        };

        jittered.min(self.policy.max_delay)
    }

    /// Sleeps for [`Self::delay_for`]; returns false if cancelled first.
    pub async fn backoff(&self, cancel: &CancellationToken, failed_attempts: u32) -> bool {
        let delay = self.delay_for(failed_attempts);
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Invokes `operation` until it stops returning `TransientError` or
    /// `max_attempts` calls have been made.
    ///
    /// Exhaustion yields `PermanentError("retries exhausted: <last reason>")`.
    /// Cancellation during a call or a delay yields `Cancelled` immediately.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> StepResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StepResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return StepResult::Cancelled;
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return StepResult::Cancelled,
                result = operation() => result,
            };

            let reason = match result {
                StepResult::TransientError(reason) => reason,
                other => return other,
            };

            if attempt >= max_attempts {
                tracing::warn!(attempt, reason = %reason, "retries exhausted");
                return StepResult::exhausted(reason);
            }

            metrics::counter!("retry_attempts_total").increment(1);
            tracing::debug!(attempt, reason = %reason, "transient failure, backing off");

            if !self.backoff(cancel, attempt).await {
                return StepResult::Cancelled;
            }
        }
    }
}
