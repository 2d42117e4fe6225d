//! Process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use fulfillment::{ConfigError, FulfillmentConfig};

/// Worker process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `METRICS_ADDR`: Prometheus listener address (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DEMO_ORDERS`: orders to seed at startup (default: `20`)
/// - `SHUTDOWN_GRACE_MS`: time in-flight orders get on shutdown (default: `10000`)
/// - every `FULFILLMENT_*` variable, see [`FulfillmentConfig`]
#[derive(Debug, Clone)]
pub struct Config {
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub demo_orders: usize,
    pub shutdown_grace: Duration,
    pub fulfillment: FulfillmentConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            metrics_addr: parse(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            demo_orders: parse(&lookup, "DEMO_ORDERS", defaults.demo_orders)?,
            shutdown_grace: Duration::from_millis(parse(
                &lookup,
                "SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace.as_millis() as u64,
            )?),
            fulfillment: FulfillmentConfig::from_lookup(&lookup)?,
        })
    }
}

fn parse<T: std::str::FromStr>(
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

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
            demo_orders: 20,
            shutdown_grace: Duration::from_secs(10),
            fulfillment: FulfillmentConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulfillment::OverflowPolicy;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.demo_orders, 20);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup_reads_process_and_pool_settings() {
        let config = Config::from_lookup(|key| match key {
            "METRICS_ADDR" => Some("127.0.0.1:9100".to_string()),
            "DEMO_ORDERS" => Some("0".to_string()),
            "FULFILLMENT_OVERFLOW_POLICY" => Some("wait".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.metrics_addr.port(), 9100);
        assert_eq!(config.demo_orders, 0);
        assert_eq!(config.fulfillment.overflow_policy, OverflowPolicy::Wait);
        assert_eq!(config.fulfillment.worker_count, 4);
    }

    #[test]
    fn test_bad_metrics_addr_is_rejected() {
        let err = Config::from_lookup(|key| (key == "METRICS_ADDR").then(|| "nowhere".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "METRICS_ADDR".to_string(),
                value: "nowhere".to_string(),
            }
        );
    }
}
