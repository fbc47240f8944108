use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Runtime circuit state for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds and timers.
///
/// The breaker trips when, within one rolling `window`, at least `min_requests`
/// calls were made and the share of failures reached `failure_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub min_requests: u32,
    pub failure_ratio: f64,
    /// Closed-state counts are cleared every `window`. Zero keeps counts until a transition.
    pub window: Duration,
    pub reset_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 5,
            failure_ratio: 0.5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "circuit.failure_ratio",
                format!("must be within (0, 1], got {}", self.failure_ratio),
            ));
        }
        if self.min_requests == 0 {
            return Err(ConfigError::invalid(
                "circuit.min_requests",
                "must be at least 1",
            ));
        }
        if self.half_open_max_requests == 0 {
            return Err(ConfigError::invalid(
                "circuit.half_open_max_requests",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }
}

/// Request/outcome counters for the current breaker generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }

    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Outcomes reported with a permit from an earlier generation are ignored, so a
/// slow call that started before a transition cannot flip the new state.
#[must_use = "a permit must be settled with record_success, record_failure or release"]
#[derive(Debug)]
pub struct Permit {
    generation: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    counts: Counts,
    generation: u64,
    expiry: Option<Instant>,
}

/// Thread-safe circuit breaker owned by one resilient client.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let expiry = window_expiry(config.window, Instant::now());
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admits a call unless the circuit is open or the half-open trial quota is used up.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);

        match inner.state {
            CircuitState::Open => None,
            CircuitState::HalfOpen
                if inner.counts.requests >= self.config.half_open_max_requests =>
            {
                None
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.counts.on_request();
                Some(Permit {
                    generation: inner.generation,
                })
            }
        }
    }

    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);
        if permit.generation != inner.generation {
            return;
        }

        inner.counts.on_success();
        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.config.half_open_max_requests
        {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
    }

    pub fn record_failure(&self, permit: Permit) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh_state(&mut inner, now);
        if permit.generation != inner.generation {
            return;
        }

        inner.counts.on_failure();
        match inner.state {
            CircuitState::Closed if self.config.should_trip(&inner.counts) => {
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    /// Returns an admission without an outcome, e.g. when the caller cancelled the call.
    pub fn release(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit.generation == inner.generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().0
    }

    pub fn counts(&self) -> Counts {
        self.snapshot().1
    }

    /// State and counts read under one lock acquisition.
    pub fn snapshot(&self) -> (CircuitState, Counts) {
        let mut inner = self.lock();
        self.refresh_state(&mut inner, Instant::now());
        (inner.state, inner.counts)
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_state(&self, inner: &mut CircuitInner, now: Instant) {
        let expired = inner.expiry.is_some_and(|expiry| now >= expiry);
        if !expired {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.generation = inner.generation.wrapping_add(1);
                inner.counts = Counts::default();
                inner.expiry = window_expiry(self.config.window, now);
            }
            CircuitState::Open => self.transition(inner, CircuitState::HalfOpen, now),
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match to {
            CircuitState::Closed => window_expiry(self.config.window, now),
            CircuitState::Open => Some(now + self.config.reset_timeout),
            CircuitState::HalfOpen => None,
        };

        match to {
            CircuitState::Open => warn!(
                provider = %self.name,
                from = %from,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(provider = %self.name, "circuit half-open, probing"),
            CircuitState::Closed => info!(provider = %self.name, from = %from, "circuit closed"),
        }
    }
}

fn window_expiry(window: Duration, now: Instant) -> Option<Instant> {
    if window.is_zero() {
        None
    } else {
        Some(now + window)
    }
}
