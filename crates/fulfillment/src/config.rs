//! Fulfillment configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use resilience::{CircuitBreakerConfig, RetryPolicy};

use crate::error::ConfigError;

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail immediately with `QueueFull`.
    #[default]
    Reject,
    /// Suspend the producer until space frees up.
    Wait,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "wait" => Ok(OverflowPolicy::Wait),
            _ => Err(ConfigError::InvalidValue {
                key: "FULFILLMENT_OVERFLOW_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// All tunables for the queue, worker pool, retries and circuit breakers.
///
/// Reads from environment variables (all optional):
/// - `FULFILLMENT_QUEUE_CAPACITY` (default: `64`)
/// - `FULFILLMENT_WORKER_COUNT` (default: `4`)
/// - `FULFILLMENT_OVERFLOW_POLICY`: `reject` or `wait` (default: `reject`)
/// - `FULFILLMENT_MAX_RETRY_ATTEMPTS` (default: `3`)
/// - `FULFILLMENT_BASE_RETRY_DELAY_MS` (default: `100`)
/// - `FULFILLMENT_MAX_RETRY_DELAY_MS` (default: `5000`)
/// - `FULFILLMENT_RETRY_JITTER` (default: `0.1`)
/// - `FULFILLMENT_CIRCUIT_FAILURE_THRESHOLD` (default: `5`)
/// - `FULFILLMENT_CIRCUIT_FAILURE_WINDOW_MS` (default: `60000`)
/// - `FULFILLMENT_CIRCUIT_COOLDOWN_MS` (default: `30000`)
/// - `FULFILLMENT_PER_CALL_TIMEOUT_MS` (default: `2000`)
/// - `FULFILLMENT_NOTIFICATION_MAX_ATTEMPTS` (default: `5`)
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_retry_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_failure_window_ms: u64,
    pub circuit_cooldown_ms: u64,
    pub per_call_timeout_ms: u64,
    pub notification_max_attempts: u32,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            worker_count: 4,
            overflow_policy: OverflowPolicy::Reject,
            max_retry_attempts: 3,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
            retry_jitter: 0.1,
            circuit_failure_threshold: 5,
            circuit_failure_window_ms: 60_000,
            circuit_cooldown_ms: 30_000,
            per_call_timeout_ms: 2_000,
            notification_max_attempts: 5,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

impl FulfillmentConfig {
    /// Loads configuration from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            queue_capacity: parse_var(&lookup, "FULFILLMENT_QUEUE_CAPACITY", defaults.queue_capacity)?,
            worker_count: parse_var(&lookup, "FULFILLMENT_WORKER_COUNT", defaults.worker_count)?,
            overflow_policy: parse_var(
                &lookup,
                "FULFILLMENT_OVERFLOW_POLICY",
                defaults.overflow_policy,
            )?,
            max_retry_attempts: parse_var(
                &lookup,
                "FULFILLMENT_MAX_RETRY_ATTEMPTS",
                defaults.max_retry_attempts,
            )?,
            base_retry_delay_ms: parse_var(
                &lookup,
                "FULFILLMENT_BASE_RETRY_DELAY_MS",
                defaults.base_retry_delay_ms,
            )?,
            max_retry_delay_ms: parse_var(
                &lookup,
                "FULFILLMENT_MAX_RETRY_DELAY_MS",
                defaults.max_retry_delay_ms,
            )?,
            retry_jitter: parse_var(&lookup, "FULFILLMENT_RETRY_JITTER", defaults.retry_jitter)?,
            circuit_failure_threshold: parse_var(
                &lookup,
                "FULFILLMENT_CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            )?,
            circuit_failure_window_ms: parse_var(
                &lookup,
                "FULFILLMENT_CIRCUIT_FAILURE_WINDOW_MS",
                defaults.circuit_failure_window_ms,
            )?,
            circuit_cooldown_ms: parse_var(
                &lookup,
                "FULFILLMENT_CIRCUIT_COOLDOWN_MS",
                defaults.circuit_cooldown_ms,
            )?,
            per_call_timeout_ms: parse_var(
                &lookup,
                "FULFILLMENT_PER_CALL_TIMEOUT_MS",
                defaults.per_call_timeout_ms,
            )?,
            notification_max_attempts: parse_var(
                &lookup,
                "FULFILLMENT_NOTIFICATION_MAX_ATTEMPTS",
                defaults.notification_max_attempts,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid("max_retry_attempts must be at least 1".into()));
        }
        if self.notification_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "notification_max_attempts must be at least 1".into(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_failure_threshold must be at least 1".into(),
            ));
        }
        if self.per_call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("per_call_timeout_ms must be positive".into()));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::Invalid(
                "max_retry_delay_ms must not be below base_retry_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid("retry_jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    /// Retry policy for individual collaborator calls and order re-runs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter_factor: self.retry_jitter,
        }
    }

    /// Retry policy for out-of-band confirmation re-delivery.
    pub fn notification_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notification_max_attempts,
            ..self.retry_policy()
        }
    }

    /// Circuit breaker settings shared by all endpoints.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            failure_window: Duration::from_millis(self.circuit_failure_window_ms),
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
        }
    }

    /// Timeout applied to every collaborator call.
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = FulfillmentConfig::default();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.notification_max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_yields_defaults() {
        let config = FulfillmentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FulfillmentConfig::default());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = FulfillmentConfig::from_lookup(lookup(&[
            ("FULFILLMENT_QUEUE_CAPACITY", "2"),
            ("FULFILLMENT_WORKER_COUNT", "1"),
            ("FULFILLMENT_OVERFLOW_POLICY", "Wait"),
            ("FULFILLMENT_CIRCUIT_COOLDOWN_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.overflow_policy, OverflowPolicy::Wait);
        assert_eq!(config.circuit_breaker().cooldown, Duration::from_millis(250));
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let err = FulfillmentConfig::from_lookup(lookup(&[("FULFILLMENT_WORKER_COUNT", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "FULFILLMENT_WORKER_COUNT".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn test_validation_rejects_zero_capacity_and_workers() {
        let config = FulfillmentConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = FulfillmentConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_bad_jitter_and_delays() {
        let config = FulfillmentConfig {
            retry_jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FulfillmentConfig {
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_policies() {
        let config = FulfillmentConfig::default();
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(100));

        let notification = config.notification_retry_policy();
        assert_eq!(notification.max_attempts, 5);
        assert_eq!(notification.max_delay, Duration::from_secs(5));
        assert_eq!(config.per_call_timeout(), Duration::from_secs(2));
    }
}
