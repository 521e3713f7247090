//! Dispatcher configuration.
//!
//! Values are validated once, at [`DispatcherConfigBuilder::build`], instead
//! of being discovered wrong at the first 429.

use crate::request::Headers;
use std::time::Duration;

/// Unit of numeric `retry_after` values in rejection bodies and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryAfterUnit {
    /// Seconds, possibly fractional (current API versions).
    #[default]
    Seconds,
    /// Whole milliseconds (legacy API versions).
    Milliseconds,
}

impl RetryAfterUnit {
    /// Convert a raw value into a duration; negative or non-finite values are `None`.
    pub fn to_duration(self, value: f64) -> Option<Duration> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let secs = match self {
            RetryAfterUnit::Seconds => value,
            RetryAfterUnit::Milliseconds => value / 1_000.0,
        };
        Duration::try_from_secs_f64(secs).ok()
    }
}

/// Errors produced when validating dispatcher configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `fallback_retry_after` must be > 0 or a throttled bucket would spin.
    #[error("fallback_retry_after must be > 0")]
    ZeroFallbackRetryAfter,
    /// The cap must leave room for the fallback.
    #[error("max_retry_after ({max:?}) must be >= fallback_retry_after ({fallback:?})")]
    MaxBelowFallback {
        /// Configured cap.
        max: Duration,
        /// Configured fallback.
        fallback: Duration,
    },
    /// Header names/values must be visible ASCII without control characters.
    #[error("invalid default header `{0}`")]
    InvalidHeader(String),
}

/// Validated configuration for a [`crate::Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    retry_after_unit: RetryAfterUnit,
    fallback_retry_after: Duration,
    max_retry_after: Option<Duration>,
    reset_cushion: Duration,
    default_headers: Headers,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_after_unit: RetryAfterUnit::Seconds,
            fallback_retry_after: Duration::from_secs(1),
            max_retry_after: None,
            reset_cushion: Duration::ZERO,
            default_headers: Headers::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    pub fn retry_after_unit(&self) -> RetryAfterUnit {
        self.retry_after_unit
    }

    /// Wait applied when a 429 carries no usable retry-after value.
    pub fn fallback_retry_after(&self) -> Duration {
        self.fallback_retry_after
    }

    pub fn max_retry_after(&self) -> Option<Duration> {
        self.max_retry_after
    }

    /// Extra wait added to every server-provided deadline.
    pub fn reset_cushion(&self) -> Duration {
        self.reset_cushion
    }

    /// Headers merged into every submitted request.
    pub fn default_headers(&self) -> &Headers {
        &self.default_headers
    }

    /// Apply the cap and cushion to a server-provided wait.
    pub(crate) fn effective_wait(&self, wait: Duration) -> Duration {
        let capped = match self.max_retry_after {
            Some(max) => wait.min(max),
            None => wait,
        };
        capped.saturating_add(self.reset_cushion)
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn retry_after_unit(mut self, unit: RetryAfterUnit) -> Self {
        self.config.retry_after_unit = unit;
        self
    }

    pub fn fallback_retry_after(mut self, wait: Duration) -> Self {
        self.config.fallback_retry_after = wait;
        self
    }

    pub fn max_retry_after(mut self, cap: Duration) -> Self {
        self.config.max_retry_after = Some(cap);
        self
    }

    pub fn reset_cushion(mut self, cushion: Duration) -> Self {
        self.config.reset_cushion = cushion;
        self
    }

    /// Set the `Authorization` header, e.g. `"Bot <token>"`.
    pub fn token(self, authorization: impl Into<String>) -> Self {
        self.default_header("Authorization", authorization)
    }

    pub fn user_agent(self, agent: impl Into<String>) -> Self {
        self.default_header("User-Agent", agent)
    }

    pub fn default_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name, value);
        self
    }

    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        let config = self.config;
        if config.fallback_retry_after.is_zero() {
            return Err(ConfigError::ZeroFallbackRetryAfter);
        }
        if let Some(max) = config.max_retry_after {
            if max < config.fallback_retry_after {
                return Err(ConfigError::MaxBelowFallback {
                    max,
                    fallback: config.fallback_retry_after,
                });
            }
        }
        for (name, value) in config.default_headers.iter() {
            let name_ok = !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':');
            let value_ok = value.bytes().all(|b| b == b' ' || b == b'\t' || b.is_ascii_graphic());
            if !name_ok || !value_ok {
                return Err(ConfigError::InvalidHeader(name.to_owned()));
            }
        }
        Ok(config)
    }
}
