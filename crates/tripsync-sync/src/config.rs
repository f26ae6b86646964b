//! Configuration for the sync core.
//!
//! Every knob has a default that matches production behavior. Values can be
//! overridden in code with the `with_*` builders, from `TRIPSYNC_*`
//! environment variables, or from JSON.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry schedule for remote mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Factor applied to the delay for each further retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with no delays, for tests and local loops.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    ///
    /// `base_delay_ms * backoff_multiplier ^ attempt`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        millis(ms)
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Items allowed per window.
    pub max_events: u32,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitConfig {
    #[must_use]
    pub const fn new(max_events: u32, window_ms: u64) -> Self {
        Self {
            max_events,
            window_ms,
        }
    }

    /// Default for outgoing chat messages, per scope and author.
    #[must_use]
    pub const fn message_send() -> Self {
        Self::new(5, 10_000)
    }

    /// Default for inbound events, per scope.
    #[must_use]
    pub const fn ingestion() -> Self {
        Self::new(200, 1_000)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Capped exponential backoff used when re-opening dropped bus channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff in milliseconds.
    pub initial_ms: u64,

    /// Maximum backoff in milliseconds.
    pub max_ms: u64,

    /// Multiplier for each further attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Backoff for the given consecutive failure count.
    #[must_use]
    pub fn duration(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let ms = self.initial_ms as f64 * self.multiplier.powi(exponent);
        millis(ms.min(self.max_ms as f64))
    }

    /// Reconnect immediately, for tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
        }
    }
}

/// Top-level configuration for a [`SyncContext`](crate::SyncContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryConfig,

    /// Outgoing chat messages per `scope:author`.
    pub send_limit: RateLimitConfig,

    /// Inbound bus events per scope.
    pub ingest_limit: RateLimitConfig,

    /// Hot-window size of each scope buffer.
    pub buffer_capacity: usize,

    pub reconnect: BackoffConfig,

    /// Refetch-and-retry rounds after a version conflict.
    pub max_conflict_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            send_limit: RateLimitConfig::message_send(),
            ingest_limit: RateLimitConfig::ingestion(),
            buffer_capacity: 500,
            reconnect: BackoffConfig::default(),
            max_conflict_retries: 3,
        }
    }
}

impl SyncConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let retry = RetryConfig {
            max_retries: env_or("TRIPSYNC_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay_ms: env_or("TRIPSYNC_BASE_DELAY_MS", defaults.retry.base_delay_ms)?,
            backoff_multiplier: env_or(
                "TRIPSYNC_BACKOFF_MULTIPLIER",
                defaults.retry.backoff_multiplier,
            )?,
        };

        let send_limit = RateLimitConfig::new(
            env_or("TRIPSYNC_SEND_LIMIT", defaults.send_limit.max_events)?,
            env_or("TRIPSYNC_SEND_WINDOW_MS", defaults.send_limit.window_ms)?,
        );

        let ingest_limit = RateLimitConfig::new(
            env_or("TRIPSYNC_INGEST_LIMIT", defaults.ingest_limit.max_events)?,
            env_or("TRIPSYNC_INGEST_WINDOW_MS", defaults.ingest_limit.window_ms)?,
        );

        let buffer_capacity = env_or("TRIPSYNC_BUFFER_CAPACITY", defaults.buffer_capacity)?;

        Self {
            retry,
            send_limit,
            ingest_limit,
            buffer_capacity,
            ..defaults
        }
        .validated()
    }

    /// Parse config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }

    /// Reject values the core cannot run with.
    pub fn validated(self) -> Result<Self> {
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be at least 1".into()));
        }
        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.send_limit.window_ms == 0 || self.ingest_limit.window_ms == 0 {
            return Err(Error::Config("rate limit windows must be non-zero".into()));
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_send_limit(mut self, limit: RateLimitConfig) -> Self {
        self.send_limit = limit;
        self
    }

    #[must_use]
    pub fn with_ingest_limit(mut self, limit: RateLimitConfig) -> Self {
        self.ingest_limit = limit;
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_millis(ms.round().min(u64::MAX as f64) as u64)
    } else {
        Duration::ZERO
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid {name}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
