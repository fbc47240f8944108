//! Provider health registry.
//!
//! The registry maps provider names to the live circuit of the resilient client
//! registered under that name, plus last success/failure bookkeeping. It is an
//! explicitly constructed value shared through `Arc`, never process-global state.
//! Reads hand out owned [`ProviderHealth`] snapshots.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::circuit_breaker::{CircuitBreaker, CircuitState, Counts};
use crate::resilient_client::ResilientClient;

/// Observability classification derived from a circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl From<CircuitState> for HealthState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::HalfOpen => Self::Degraded,
            CircuitState::Open => Self::Unhealthy,
        }
    }
}

/// Point-in-time health snapshot of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub circuit_state: CircuitState,
    pub counts: Counts,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn health_state(&self) -> HealthState {
        HealthState::from(self.circuit_state)
    }

    pub fn is_healthy(&self) -> bool {
        self.health_state() == HealthState::Healthy
    }

    pub fn is_degraded(&self) -> bool {
        self.health_state() == HealthState::Degraded
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health_state() == HealthState::Unhealthy
    }
}

/// Provider counts per health classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl HealthSummary {
    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy
    }
}

#[derive(Debug)]
struct Entry {
    breaker: Arc<CircuitBreaker>,
    last_success: Option<OffsetDateTime>,
    last_failure: Option<OffsetDateTime>,
    last_error: Option<String>,
}

impl Entry {
    fn snapshot(&self, name: &str) -> ProviderHealth {
        let (circuit_state, counts) = self.breaker.snapshot();
        ProviderHealth {
            name: name.to_owned(),
            circuit_state,
            counts,
            last_success: self.last_success,
            last_failure: self.last_failure,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `client` under `name`, replacing any previous registration and its bookkeeping.
    pub fn register(&self, name: impl Into<String>, client: &ResilientClient) {
        let entry = Entry {
            breaker: client.circuit_breaker(),
            last_success: None,
            last_failure: None,
            last_error: None,
        };
        self.write().insert(name.into(), entry);
    }

    pub fn unregister(&self, name: &str) {
        self.write().remove(name);
    }

    /// No-op for unknown names.
    pub fn record_success(&self, name: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.last_success = Some(OffsetDateTime::now_utc());
        }
    }

    /// No-op for unknown names.
    pub fn record_failure(&self, name: &str, error: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.last_failure = Some(OffsetDateTime::now_utc());
            entry.last_error = Some(error.to_owned());
        }
    }

    pub fn get_health(&self, name: &str) -> Option<ProviderHealth> {
        self.read().get(name).map(|entry| entry.snapshot(name))
    }

    /// Snapshots of every registered provider, sorted by name.
    pub fn get_all_health(&self) -> Vec<ProviderHealth> {
        let mut all = self
            .read()
            .iter()
            .map(|(name, entry)| entry.snapshot(name))
            .collect::<Vec<_>>();
        all.sort_by(|left, right| left.name.cmp(&right.name));
        all
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for health in self.get_all_health() {
            match health.health_state() {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
