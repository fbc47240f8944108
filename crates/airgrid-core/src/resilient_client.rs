//! Protected execution of provider round trips.
//!
//! A [`ResilientClient`] runs a caller-supplied unit of work behind its own
//! [`CircuitBreaker`], retrying retryable outcomes with exponential backoff.
//!
//! | Outcome of an attempt | Breaker | Retried |
//! |-----------------------|---------|---------|
//! | 2xx/3xx response | success | no |
//! | 4xx response (except 408/429) | success | no, returned as-is |
//! | 5xx, 408 or 429 response | failure | yes |
//! | transport error or attempt timeout | failure | yes, unless marked non-retryable |
//! | circuit open | not executed | no, fails with `CircuitOpen` |
//!
//! When every attempt produced a retryable response, the last response is
//! returned so the caller can inspect its status and body. Only when no
//! response was ever received does the call fail with `MaxRetriesExceeded`.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{RateLimit, ResilienceConfig};
use crate::context::FetchContext;
use crate::error::{ConfigError, FetchError};
use crate::health::HealthRegistry;
use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How an attempt's result counts for retry and breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Caller-caused failure: terminal, not held against the provider.
    ClientError { status: u16 },
    /// Provider-side failure: retried and counted against the breaker.
    ServerError { status: u16 },
}

/// Classification of a unit-of-work result.
pub trait Classify {
    fn classify(&self) -> Outcome;
}

impl Classify for HttpResponse {
    fn classify(&self) -> Outcome {
        match self.status {
            408 | 429 => Outcome::ServerError {
                status: self.status,
            },
            status if status >= 500 => Outcome::ServerError { status },
            status if status >= 400 => Outcome::ClientError { status },
            _ => Outcome::Success,
        }
    }
}

/// Result of a protected execution together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Execution<T> {
    /// Attempts beyond the first one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Retry + circuit breaker wrapper around one provider.
pub struct ResilientClient {
    name: String,
    config: ResilienceConfig,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<DirectRateLimiter>>,
    registry: Option<Arc<HealthRegistry>>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.breaker.state())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl ResilientClient {
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let limiter = match config.rate_limit {
            Some(limit) => Some(Arc::new(RateLimiter::direct(quota_for(limit)?))),
            None => None,
        };

        Ok(Self {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), config.breaker)),
            name,
            config,
            limiter,
            registry: None,
        })
    }

    /// Registers this client with `registry` and reports every outcome to it.
    pub fn with_registry(mut self, registry: Arc<HealthRegistry>) -> Self {
        registry.register(self.name.clone(), &self);
        self.registry = Some(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Runs `unit` behind the breaker with retries, reporting the final outcome to the registry.
    pub async fn execute<T, F, Fut>(
        &self,
        context: &FetchContext,
        mut unit: F,
    ) -> Result<Execution<T>, FetchError>
    where
        T: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let result = self.run_attempts(context, &mut unit).await;
        self.report(&result);
        result
    }

    /// Sends `request` through `http` as the unit of work.
    pub async fn send(
        &self,
        context: &FetchContext,
        http: &dyn HttpClient,
        request: HttpRequest,
    ) -> Result<Execution<HttpResponse>, FetchError> {
        self.execute(context, || http.execute(request.clone())).await
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        context: &FetchContext,
        unit: &mut F,
    ) -> Result<Execution<T>, FetchError>
    where
        T: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_response: Option<T> = None;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            context.check()?;
            let Some(permit) = self.breaker.try_acquire() else {
                debug!(provider = %self.name, attempt, "circuit open, call rejected");
                return Err(FetchError::CircuitOpen {
                    provider: self.name.clone(),
                });
            };

            if let Some(limiter) = &self.limiter {
                if let Err(cancelled) = context.run(limiter.until_ready()).await {
                    self.breaker.release(permit);
                    return Err(cancelled);
                }
            }

            let outcome = context
                .run(tokio::time::timeout(self.config.attempt_timeout, unit()))
                .await;

            match outcome {
                Err(cancelled) => {
                    self.breaker.release(permit);
                    return Err(cancelled);
                }
                Ok(Err(_elapsed)) => {
                    self.breaker.record_failure(permit);
                    last_error = format!(
                        "attempt timed out after {}ms",
                        self.config.attempt_timeout.as_millis()
                    );
                    debug!(provider = %self.name, attempt, "attempt timed out");
                }
                Ok(Ok(Err(error))) => {
                    self.breaker.record_failure(permit);
                    if !error.retryable() {
                        return Err(FetchError::transport(error.message()));
                    }
                    debug!(provider = %self.name, attempt, error = %error, "transport error");
                    last_error = error.message().to_owned();
                }
                Ok(Ok(Ok(value))) => match value.classify() {
                    Outcome::Success => {
                        self.breaker.record_success(permit);
                        return Ok(Execution {
                            value,
                            attempts: attempt,
                        });
                    }
                    Outcome::ClientError { status } => {
                        self.breaker.record_success(permit);
                        debug!(provider = %self.name, attempt, status, "client error, not retried");
                        return Ok(Execution {
                            value,
                            attempts: attempt,
                        });
                    }
                    Outcome::ServerError { status } => {
                        self.breaker.record_failure(permit);
                        debug!(provider = %self.name, attempt, status, "retryable response");
                        last_error = format!("upstream returned status {status}");
                        last_response = Some(value);
                    }
                },
            }

            if attempt < max_attempts {
                let delay = self.config.retry.delay(attempt - 1);
                debug!(
                    provider = %self.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                context.sleep(delay).await?;
            }
        }

        if let Some(value) = last_response {
            warn!(
                provider = %self.name,
                attempts = max_attempts,
                error = %last_error,
                "retries exhausted, returning last response"
            );
            return Ok(Execution {
                value,
                attempts: max_attempts,
            });
        }

        warn!(
            provider = %self.name,
            attempts = max_attempts,
            error = %last_error,
            "retries exhausted without a response"
        );
        Err(FetchError::MaxRetriesExceeded {
            provider: self.name.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    fn report<T: Classify>(&self, result: &Result<Execution<T>, FetchError>) {
        let Some(registry) = &self.registry else {
            return;
        };

        match result {
            Ok(execution) => match execution.value.classify() {
                Outcome::ServerError { status } => registry.record_failure(
                    &self.name,
                    &FetchError::Server { status }.to_string(),
                ),
                Outcome::Success | Outcome::ClientError { .. } => {
                    registry.record_success(&self.name)
                }
            },
            Err(error) if error.is_cancellation() => {}
            Err(error) => registry.record_failure(&self.name, &error.to_string()),
        }
    }
}

fn quota_for(limit: RateLimit) -> Result<Quota, ConfigError> {
    NonZeroU32::new(limit.requests)
        .and_then(|burst| {
            Quota::with_period(limit.per / burst.get()).map(|quota| quota.allow_burst(burst))
        })
        .ok_or_else(|| {
            ConfigError::invalid(
                "resilience.rate_limit",
                "period per request must be at least one nanosecond",
            )
        })
}
