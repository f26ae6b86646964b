//! Retry policy engine.
//!
//! Runs a fallible async operation up to `max_retries + 1` times, waiting
//! `base_delay_ms * backoff_multiplier^attempt` between attempts. Errors the
//! taxonomy marks permanent (validation, conflict, auth, rate limit) are
//! returned immediately without consuming retry budget.
//!
//! There is an attempt ceiling but no wall-clock ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::observe::{Breadcrumb, Level, Notice, Notifier, Observability};

const CATEGORY: &str = "retry";

/// Sleep function, swappable so tests can observe delays without waiting.
pub trait Sleep: Clone + Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bookkeeping for one `execute` call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationAttempt {
    /// 0-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

/// Executes operations with bounded retries and exponential backoff.
#[derive(Clone)]
pub struct RetryPolicy<S: Sleep = TokioSleep> {
    config: RetryConfig,
    sleep: S,
    observability: Arc<dyn Observability>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RetryPolicy<TokioSleep> {
    pub fn new(config: RetryConfig, observability: Arc<dyn Observability>) -> Self {
        Self {
            config,
            sleep: TokioSleep,
            observability,
            notifier: None,
        }
    }
}

impl<S: Sleep> RetryPolicy<S> {
    /// Replace the sleep implementation.
    #[must_use]
    pub fn with_sleep<T: Sleep>(self, sleep: T) -> RetryPolicy<T> {
        RetryPolicy {
            config: self.config,
            sleep,
            observability: self.observability,
            notifier: self.notifier,
        }
    }

    /// Surface retry progress to the user.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub(crate) fn observability(&self) -> &Arc<dyn Observability> {
        &self.observability
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(op, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(next_attempt, &error)`
    /// after each backoff wait. `next_attempt` is 1-based.
    pub async fn execute_with<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32, &Error),
    {
        let mut state = MutationAttempt {
            attempt: 0,
            max_attempts: self.config.max_retries.saturating_add(1),
            last_error: None,
        };

        loop {
            trace!(
                attempt = state.attempt,
                max_attempts = state.max_attempts,
                last_error = ?state.last_error,
                "Attempting operation"
            );
            self.observability.add_breadcrumb(
                Breadcrumb::new(CATEGORY, "attempt", Level::Debug)
                    .with("attempt", state.attempt + 1)
                    .with("maxAttempts", state.max_attempts),
            );

            let err = match op().await {
                Ok(value) => {
                    if state.attempt > 0 {
                        debug!(retries = state.attempt, "Operation succeeded after retries");
                        self.observability.add_breadcrumb(
                            Breadcrumb::new(CATEGORY, "recovered", Level::Info)
                                .with("retries", state.attempt),
                        );
                        self.notify(Notice::recovered(state.attempt));
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(kind = err.kind(), "Permanent failure, not retrying: {}", err);
                self.observability.add_breadcrumb(
                    Breadcrumb::new(CATEGORY, "permanent failure", Level::Warning)
                        .with("attempt", state.attempt + 1)
                        .with("kind", err.kind())
                        .with("error", err.to_string()),
                );
                return Err(err);
            }

            if state.attempt >= self.config.max_retries {
                warn!(
                    attempts = state.attempt + 1,
                    kind = err.kind(),
                    "Retries exhausted: {}",
                    err
                );
                self.observability.add_breadcrumb(
                    Breadcrumb::new(CATEGORY, "exhausted", Level::Error)
                        .with("attempts", state.attempt + 1)
                        .with("error", err.to_string()),
                );
                self.observability.capture_exception(&err, "retries exhausted");
                self.notify(Notice::exhausted(self.config.max_retries));
                return Err(err);
            }

            let delay = self.config.delay_for(state.attempt);
            warn!(
                attempt = state.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                kind = err.kind(),
                "Attempt failed, backing off: {}",
                err
            );
            self.observability.add_breadcrumb(
                Breadcrumb::new(CATEGORY, "attempt failed", Level::Warning)
                    .with("attempt", state.attempt + 1)
                    .with("delayMs", delay.as_millis() as u64)
                    .with("error", err.to_string()),
            );
            self.notify(Notice::retrying(state.attempt + 1, delay));

            self.sleep.sleep(delay).await;
            on_retry(state.attempt + 1, &err);
            state.attempt += 1;
            state.last_error = Some(err.to_string());
        }
    }

    fn notify(&self, notice: Notice) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notice);
        }
    }
}

impl<S: Sleep> std::fmt::Debug for RetryPolicy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
