//! # Airgrid Core
//!
//! Resilient fetch-through layer for environmental data providers (air quality,
//! weather, pollen, UV, transit).
//!
//! ## Overview
//!
//! This crate sits between an aggregator and its upstream providers:
//!
//! - **Resilient client** wrapping every upstream call in retries and a circuit breaker
//! - **Provider health registry** exposing circuit state for health endpoints
//! - **Fetch-through cache** keyed by geographic grid cell, with stale-if-error
//! - **Refresh scheduler** warming the caches for many points with a bounded worker pool
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Geo-bucketed fetch-through cache and single-value snapshot cache |
//! | [`circuit_breaker`] | Circuit breaker state machine |
//! | [`config`] | Immutable configuration and `AIRGRID_*` environment loading |
//! | [`context`] | Cancellation and deadline context |
//! | [`error`] | Core error types |
//! | [`geo`] | Coordinates and grid bucketing |
//! | [`health`] | Provider health registry |
//! | [`http_client`] | HTTP client abstraction |
//! | [`provider`] | Provider and feature-flag capabilities |
//! | [`resilient_client`] | Retry + circuit breaker execution |
//! | [`retry`] | Exponential backoff policy |
//! | [`scheduler`] | Concurrent refresh scheduler |
//! | [`telemetry`] | Tracing subscriber setup |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use airgrid_core::{
//!     AirgridConfig, FetchContext, FetchThroughCache, HealthRegistry, HttpPointProvider,
//!     ReqwestHttpClient, ResilientClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AirgridConfig::from_env()?;
//!     let registry = Arc::new(HealthRegistry::new());
//!
//!     let client = Arc::new(
//!         ResilientClient::new("air_quality", config.resilience)?
//!             .with_registry(registry.clone()),
//!     );
//!     let provider = HttpPointProvider::new(
//!         client,
//!         Arc::new(ReqwestHttpClient::default()),
//!         "https://api.example.com/air",
//!         |response| Ok(response.body.clone()),
//!     );
//!     let cache = FetchThroughCache::new(Arc::new(provider), config.cache)?;
//!
//!     let reading = cache.get(&FetchContext::new(), 52.37, 4.895).await?;
//!     println!("{reading}");
//!     println!("{:?}", registry.get_all_health());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Refresh Scheduler  │
//! └──────────┬──────────┘
//!            │ per point, per domain
//!            ▼
//! ┌─────────────────────┐
//! │ Fetch-Through Cache │
//! └──────────┬──────────┘
//!            │ miss / expired
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────┐
//! │  Resilient Client   │────▶│ Circuit Breaker  │
//! └──────────┬──────────┘     └──────────────────┘
//!            │                         │
//!            ▼                         ▼
//! ┌─────────────────────┐     ┌──────────────────┐
//! │ HTTP Client         │     │ Health Registry  │
//! │ (reqwest/static)    │     └──────────────────┘
//! └─────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Every runtime failure is a [`FetchError`]. Callers normally only see a few variants:
//!
//! ```rust
//! use airgrid_core::FetchError;
//!
//! fn handle_error(error: FetchError) {
//!     match error {
//!         FetchError::CircuitOpen { .. } => {
//!             // Back off, the provider is cooling down
//!         }
//!         FetchError::ProviderUnavailable { .. } => {
//!             // No fresh or stale value available
//!         }
//!         FetchError::InvalidCoordinates { .. } => {
//!             // Report to user
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod geo;
pub mod health;
pub mod http_client;
pub mod provider;
pub mod resilient_client;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience

// Caching
pub use cache::{CacheEntry, CacheMode, CacheStats, FetchThroughCache, SnapshotCache};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Counts, Permit};

// Configuration
pub use config::{AirgridConfig, CacheConfig, RateLimit, ResilienceConfig, SchedulerConfig};

// Context
pub use context::FetchContext;

// Error types
pub use error::{ConfigError, FetchError};

// Geography
pub use geo::{Coordinates, GeoBucketKey};

// Health
pub use health::{HealthRegistry, HealthState, HealthSummary, ProviderHealth};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpFuture, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient, StaticHttpClient,
};

// Provider capabilities
pub use provider::{
    BoxFuture, Decoder, FeatureFlags, FeatureGated, FnPointProvider, GlobalProvider,
    HttpPointProvider, PointProvider, StaticFeatureFlags,
};

// Resilient execution
pub use resilient_client::{Classify, Execution, Outcome, ResilientClient};

// Retry logic
pub use retry::RetryPolicy;

// Scheduling
pub use scheduler::{
    GlobalDomain, GlobalRefresh, Point, PointRefresh, RefreshDomain, RefreshError,
    RefreshResult, RefreshScheduler, RefreshTarget,
};

// Telemetry
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
