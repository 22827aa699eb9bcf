//! # Keyed Rate Limiter
//!
//! "Do at most once per key per window". Used to keep repeated identical
//! broker failures from flooding the logs.
//!
//! ## Window Semantics
//!
//! - A bounded FIFO of `(timestamp, key)` pairs, at most `capacity` entries
//! - A key seen less than `window` ago blocks a repeat action for that key
//! - Once capacity is exceeded the oldest entry is evicted regardless of age
//!
//! The last rule is an accepted approximation: under churn of more than
//! `capacity` distinct keys inside one window, a recently silenced key can be
//! forgotten early and logged again. Entries are appended in time order, so
//! expired entries are always at the head and are pruned there.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Single-owner keyed limiter. Wrap in [`SharedRateLimiter`] for shared use.
#[derive(Debug)]
pub struct RateLimiter {
    /// Oldest first.
    entries: VecDeque<(Instant, String)>,

    /// How long a key stays silenced.
    window: Duration,

    /// Maximum remembered keys.
    capacity: usize,
}

impl RateLimiter {
    /// Default silence window.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(crate::DEFAULT_ERROR_LOG_WINDOW_SECS);

    /// Default number of distinct keys remembered.
    pub const DEFAULT_CAPACITY: usize = crate::DEFAULT_ERROR_LOG_CAPACITY;

    /// Create a limiter with the default window and capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_WINDOW, Self::DEFAULT_CAPACITY)
    }

    /// Create a limiter with a custom window and capacity (at least 1).
    #[must_use]
    pub fn with_config(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            window,
            capacity,
        }
    }

    /// Record `key` and report whether the caller should act.
    ///
    /// Returns `false` if `key` was admitted less than `window` ago.
    pub fn admit(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.prune_expired(now);

        if self.entries.iter().any(|(_, k)| k == key) {
            return false;
        }

        self.entries.push_back((now, key.to_string()));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        true
    }

    /// Run `action` unless `key` is currently silenced.
    ///
    /// Panics inside `action` propagate to the caller.
    pub fn limit<R>(&mut self, key: &str, action: impl FnOnce() -> R) -> Option<R> {
        if self.admit(key) {
            Some(action())
        } else {
            None
        }
    }

    /// Async variant of [`RateLimiter::limit`].
    pub async fn limit_async<F, Fut, R>(&mut self, key: &str, action: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if self.admit(key) {
            Some(action().await)
        } else {
            None
        }
    }

    /// Number of remembered keys, including expired ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The silence window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum remembered keys.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn prune_expired(&mut self, now: Instant) {
        while let Some((ts, _)) = self.entries.front() {
            if now.saturating_duration_since(*ts) >= self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex-guarded limiter for callbacks that may race.
///
/// The lock is held only for the admit decision, never while the action runs.
#[derive(Debug, Default)]
pub struct SharedRateLimiter {
    inner: Mutex<RateLimiter>,
}

impl SharedRateLimiter {
    #[must_use]
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            inner: Mutex::new(limiter),
        }
    }

    pub fn admit(&self, key: &str) -> bool {
        self.inner.lock().admit(key)
    }

    pub fn limit<R>(&self, key: &str, action: impl FnOnce() -> R) -> Option<R> {
        if self.admit(key) {
            Some(action())
        } else {
            None
        }
    }

    pub async fn limit_async<F, Fut, R>(&self, key: &str, action: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if self.admit(key) {
            Some(action().await)
        } else {
            None
        }
    }
}
