//! Immutable configuration for the resilience, cache and refresh layers.
//!
//! Every struct has documented defaults and a `validate` method. [`AirgridConfig::from_env`]
//! overlays `AIRGRID_*` environment variables on top of the defaults.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `AIRGRID_RETRY_MAX_ATTEMPTS` | `resilience.retry.max_attempts` |
//! | `AIRGRID_RETRY_INITIAL_INTERVAL_MS` | `resilience.retry.initial_interval` |
//! | `AIRGRID_RETRY_MAX_INTERVAL_MS` | `resilience.retry.max_interval` |
//! | `AIRGRID_RETRY_MULTIPLIER` | `resilience.retry.multiplier` |
//! | `AIRGRID_CIRCUIT_MIN_REQUESTS` | `resilience.breaker.min_requests` |
//! | `AIRGRID_CIRCUIT_FAILURE_RATIO` | `resilience.breaker.failure_ratio` |
//! | `AIRGRID_CIRCUIT_WINDOW_SECS` | `resilience.breaker.window` |
//! | `AIRGRID_CIRCUIT_RESET_TIMEOUT_SECS` | `resilience.breaker.reset_timeout` |
//! | `AIRGRID_CIRCUIT_HALF_OPEN_REQUESTS` | `resilience.breaker.half_open_max_requests` |
//! | `AIRGRID_ATTEMPT_TIMEOUT_MS` | `resilience.attempt_timeout` |
//! | `AIRGRID_RATE_LIMIT_PER_MINUTE` | `resilience.rate_limit` |
//! | `AIRGRID_CACHE_TTL_SECS` | `cache.ttl` |
//! | `AIRGRID_CACHE_GRID_SIZE` | `cache.grid_size` |
//! | `AIRGRID_CACHE_STALE_TTL_SECS` | `cache.stale_if_error_ttl` |
//! | `AIRGRID_REFRESH_CONCURRENCY` | `scheduler.concurrency` |
//! | `AIRGRID_REFRESH_POINT_TIMEOUT_SECS` | `scheduler.point_timeout` |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheMode;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Request budget for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub per: Duration,
}

impl RateLimit {
    pub const fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            per: Duration::from_secs(60),
        }
    }
}

/// Settings of one resilient client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// Upper bound for a single attempt; an elapsed attempt is a retryable transport failure.
    pub attempt_timeout: Duration,
    pub rate_limit: Option<RateLimit>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            attempt_timeout: Duration::from_secs(10),
            rate_limit: None,
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.breaker.validate()?;
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "resilience.attempt_timeout",
                "must be greater than zero",
            ));
        }
        if let Some(limit) = self.rate_limit {
            if limit.requests == 0 || (limit.per / limit.requests).is_zero() {
                return Err(ConfigError::invalid(
                    "resilience.rate_limit",
                    "requests must be greater than zero and leave at least 1ns per request",
                ));
            }
        }
        Ok(())
    }
}

/// Settings of one fetch-through cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness window of an entry.
    pub ttl: Duration,
    /// Grid cell edge in degrees. Fixed for the lifetime of a cache.
    pub grid_size: f64,
    /// How long an entry may still be served when the provider fails.
    pub stale_if_error_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            grid_size: 0.1,
            stale_if_error_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.grid_size.is_finite() || self.grid_size <= 0.0 {
            return Err(ConfigError::invalid(
                "cache.grid_size",
                format!("must be a positive number of degrees, got {}", self.grid_size),
            ));
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("cache.ttl", "must be greater than zero"));
        }
        if self.stale_if_error_ttl < self.ttl {
            return Err(ConfigError::invalid(
                "cache.stale_if_error_ttl",
                "must not be shorter than cache.ttl",
            ));
        }
        Ok(())
    }
}

/// Settings of the concurrent refresh scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Deadline given to each point, covering all of its domain calls.
    pub point_timeout: Duration,
    pub cache_mode: CacheMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            point_timeout: Duration::from_secs(30),
            cache_mode: CacheMode::Use,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid(
                "scheduler.concurrency",
                "must be at least 1",
            ));
        }
        if self.point_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "scheduler.point_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AirgridConfig {
    pub resilience: ResilienceConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl AirgridConfig {
    /// Defaults overlaid with `AIRGRID_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with values returned by `lookup`, then validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let resilience = &mut config.resilience;

        if let Some(value) = parse(&lookup, "AIRGRID_RETRY_MAX_ATTEMPTS")? {
            resilience.retry.max_attempts = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_RETRY_INITIAL_INTERVAL_MS")? {
            resilience.retry.initial_interval = Duration::from_millis(value);
        }
        if let Some(value) = parse(&lookup, "AIRGRID_RETRY_MAX_INTERVAL_MS")? {
            resilience.retry.max_interval = Duration::from_millis(value);
        }
        if let Some(value) = parse(&lookup, "AIRGRID_RETRY_MULTIPLIER")? {
            resilience.retry.multiplier = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CIRCUIT_MIN_REQUESTS")? {
            resilience.breaker.min_requests = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CIRCUIT_FAILURE_RATIO")? {
            resilience.breaker.failure_ratio = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CIRCUIT_WINDOW_SECS")? {
            resilience.breaker.window = Duration::from_secs(value);
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CIRCUIT_RESET_TIMEOUT_SECS")? {
            resilience.breaker.reset_timeout = Duration::from_secs(value);
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CIRCUIT_HALF_OPEN_REQUESTS")? {
            resilience.breaker.half_open_max_requests = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_ATTEMPT_TIMEOUT_MS")? {
            resilience.attempt_timeout = Duration::from_millis(value);
        }
        if let Some(value) = parse::<u32, _>(&lookup, "AIRGRID_RATE_LIMIT_PER_MINUTE")? {
            resilience.rate_limit = (value > 0).then(|| RateLimit::per_minute(value));
        }

        if let Some(value) = parse(&lookup, "AIRGRID_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(value);
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CACHE_GRID_SIZE")? {
            config.cache.grid_size = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_CACHE_STALE_TTL_SECS")? {
            config.cache.stale_if_error_ttl = Duration::from_secs(value);
        }

        if let Some(value) = parse(&lookup, "AIRGRID_REFRESH_CONCURRENCY")? {
            config.scheduler.concurrency = value;
        }
        if let Some(value) = parse(&lookup, "AIRGRID_REFRESH_POINT_TIMEOUT_SECS")? {
            config.scheduler.point_timeout = Duration::from_secs(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resilience.validate()?;
        self.cache.validate()?;
        self.scheduler.validate()
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|error| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw.clone(),
            reason: error.to_string(),
        })
}
