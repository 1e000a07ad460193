//! Process configuration, read from the environment (and `.env` if present).

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ledger_service::DEFAULT_FUNDS_CHECK_TIMEOUT;
use crate::rates::DEFAULT_RATE_TTL;
use crate::resilience::{ClientConfig, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub port: u16,
    /// Postgres connection string; in-memory store when unset.
    pub database_url: Option<String>,
    /// Redis connection string; in-memory rate cache when unset.
    pub redis_url: Option<String>,
    /// Base URL of the conversion rate provider.
    pub currency_url: String,
    pub http_timeout: Duration,
    pub breaker_max_failures: u32,
    pub breaker_open_timeout: Duration,
    pub retry_max: u32,
    pub retry_base_delay: Duration,
    pub retry_max_jitter: Duration,
    pub rate_cache_ttl: Duration,
    pub funds_check_timeout: Duration,
}

impl LedgerConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let currency_url = get("CURRENCY_URL").ok_or(ConfigError::Missing("CURRENCY_URL"))?;

        Ok(Self {
            port: parse_or(&get, "APPLICATION_PORT", 8080)?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            currency_url,
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 60)?),
            breaker_max_failures: parse_or(&get, "BREAKER_MAX_FAILURES", 5)?,
            breaker_open_timeout: Duration::from_secs(parse_or(
                &get,
                "BREAKER_OPEN_TIMEOUT_SECS",
                10,
            )?),
            retry_max: parse_or(&get, "RETRY_MAX", 3)?,
            retry_base_delay: Duration::from_millis(parse_or(&get, "RETRY_BASE_DELAY_MS", 100)?),
            retry_max_jitter: Duration::from_millis(parse_or(&get, "RETRY_MAX_JITTER_MS", 100)?),
            rate_cache_ttl: Duration::from_secs(parse_or(
                &get,
                "RATE_CACHE_TTL_SECS",
                DEFAULT_RATE_TTL.as_secs(),
            )?),
            funds_check_timeout: Duration::from_millis(parse_or(
                &get,
                "FUNDS_CHECK_TIMEOUT_MS",
                DEFAULT_FUNDS_CHECK_TIMEOUT.as_millis() as u64,
            )?),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: self.http_timeout,
            retry: RetryPolicy::exponential(self.retry_max, self.retry_base_delay)
                .with_jitter(self.retry_max_jitter),
            max_failures: self.breaker_max_failures,
            open_timeout: self.breaker_open_timeout,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<LedgerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LedgerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let config = load(&[("CURRENCY_URL", "http://rates.local/latest")]).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url, None);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert_eq!(config.breaker_max_failures, 5);
        assert_eq!(config.breaker_open_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_max, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.retry_max_jitter, Duration::from_millis(100));
        assert_eq!(config.rate_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.funds_check_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn currency_url_is_required() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("CURRENCY_URL"));
        assert_eq!(
            load(&[("CURRENCY_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("CURRENCY_URL")
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = load(&[("CURRENCY_URL", "http://x"), ("RETRY_MAX", "three")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RETRY_MAX",
                value: "three".to_string()
            }
        );
    }

    #[test]
    fn overrides_flow_into_client_config() {
        let config = load(&[
            ("CURRENCY_URL", "http://x"),
            ("DATABASE_URL", "postgres://ledger@db/ledger"),
            ("APPLICATION_PORT", "9000"),
            ("RETRY_MAX", "1"),
            ("BREAKER_MAX_FAILURES", "2"),
            ("HTTP_TIMEOUT_SECS", "5"),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.database_url.as_deref(), Some("postgres://ledger@db/ledger"));

        let client = config.client_config();
        assert_eq!(client.retry.max_retries, 1);
        assert_eq!(client.max_failures, 2);
        assert_eq!(client.timeout, Duration::from_secs(5));
    }
}
