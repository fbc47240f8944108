//! Tracing subscriber setup for binaries embedding airgrid.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to the
//! host process through [`init_tracing`].

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_FILTER: &str = "airgrid_core=info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    /// Filter directives used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: String::from(DEFAULT_FILTER),
        }
    }
}

impl TelemetryConfig {
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(fmt_layer)
        .try_init()
        .map_err(|error| TelemetryError::Init(error.to_string()))
}
