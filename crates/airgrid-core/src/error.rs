use thiserror::Error;

/// Runtime errors surfaced by the resilient client, the caches and the refresh scheduler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// The provider's circuit is open; callers should back off instead of retrying.
    #[error("circuit for provider '{provider}' is open")]
    CircuitOpen { provider: String },

    /// Every attempt failed at the transport level and no response was ever received.
    #[error("provider '{provider}' failed after {attempts} attempt(s): {last_error}")]
    MaxRetriesExceeded {
        provider: String,
        attempts: u32,
        last_error: String,
    },

    /// Cache layer: the fetch failed and no usable stale entry exists.
    #[error("provider '{provider}' is unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    /// Response-level failure carried by a 5xx-equivalent status.
    #[error("upstream returned server error status {status}")]
    Server { status: u16 },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// A feature-gated provider was skipped because its flag is off.
    #[error("feature '{flag}' is disabled")]
    FeatureDisabled { flag: String },

    /// Domain-level error reported by a provider after a successful round trip.
    #[error("provider error: {message}")]
    Provider { message: String },
}

impl FetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn feature_disabled(flag: impl Into<String>) -> Self {
        Self::FeatureDisabled { flag: flag.into() }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "fetch.circuit_open",
            Self::MaxRetriesExceeded { .. } => "fetch.max_retries_exceeded",
            Self::ProviderUnavailable { .. } => "fetch.provider_unavailable",
            Self::InvalidCoordinates { .. } => "fetch.invalid_coordinates",
            Self::Server { .. } => "fetch.server_error",
            Self::Transport { .. } => "fetch.transport",
            Self::Cancelled => "fetch.cancelled",
            Self::DeadlineExceeded => "fetch.deadline_exceeded",
            Self::FeatureDisabled { .. } => "fetch.feature_disabled",
            Self::Provider { .. } => "fetch.provider",
        }
    }

    /// Whether repeating the same call later could plausibly succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Transport { .. } | Self::MaxRetriesExceeded { .. }
        )
    }

    /// Cancellation and deadline errors originate from the caller, not the provider.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
