//! Fixed-window rate limiting keyed by identity.
//!
//! Used in two places: per `scope:author` for outgoing chat messages, and per
//! scope for inbound bus events. Rejected items are dropped and logged, never
//! queued. This is a client-local safeguard; the store enforces its own limits
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Tracked keys below which expired windows are never swept.
const PRUNE_FLOOR: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts items per key within a fixed window.
///
/// A key's window resets lazily on the first call after it has expired.
/// Expired windows are swept whenever a new key would push the map past
/// twice its size after the last sweep.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<String, Window>,
    prune_at: usize,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            prune_at: PRUNE_FLOOR,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one item for `key`. Returns false if the window is full.
    pub fn allow(&mut self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Like [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        let window = self.config.window();
        if self.windows.len() >= self.prune_at && !self.windows.contains_key(key) {
            self.prune(now);
            self.prune_at = (self.windows.len() * 2).max(PRUNE_FLOOR);
        }
        let entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) > window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.config.max_events {
            debug!(
                key,
                max_events = self.config.max_events,
                window_ms = self.config.window_ms,
                "Rate limit exceeded, dropping"
            );
            return false;
        }

        entry.count += 1;
        true
    }

    /// Like [`allow`](Self::allow), as a `Result`.
    pub fn check(&mut self, key: &str) -> Result<()> {
        if self.allow(key) {
            Ok(())
        } else {
            Err(Error::RateLimited {
                key: key.to_string(),
            })
        }
    }

    /// Items still allowed for `key` in its current window.
    pub fn remaining_at(&self, key: &str, now: Instant) -> u32 {
        match self.windows.get(key) {
            Some(w) if now.saturating_duration_since(w.started) <= self.config.window() => {
                self.config.max_events.saturating_sub(w.count)
            }
            _ => self.config.max_events,
        }
    }

    /// Forget a key.
    pub fn reset(&mut self, key: &str) {
        self.windows.remove(key);
    }

    /// Drop expired windows so idle keys do not accumulate.
    pub fn prune(&mut self, now: Instant) {
        let window = self.config.window();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) <= window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Thread-safe wrapper for the rate limiter.
pub type SharedRateLimiter = Arc<Mutex<RateLimiter>>;

/// Create a new shared rate limiter.
pub fn shared(config: RateLimitConfig) -> SharedRateLimiter {
    Arc::new(Mutex::new(RateLimiter::new(config)))
}

/// Run `f` with the limiter locked.
pub(crate) fn with_limiter<R>(limiter: &SharedRateLimiter, f: impl FnOnce(&mut RateLimiter) -> R) -> R {
    f(&mut crate::lock(limiter))
}

/// Key for per-author send limits.
pub fn author_key(scope_id: &str, author_id: &str) -> String {
    format!("{scope_id}:{author_id}")
}
