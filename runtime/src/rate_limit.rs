//! Sliding-window limiter for client-initiated cancellations.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Allows at most `limit` hits per key within any `window`.
///
/// A hit is taken before the guarded work runs and handed back with
/// [`refund`](Self::refund) if the work fails, so concurrent requests from one
/// source can never overshoot the limit.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(limit: u32, window: std::time::Duration) -> Self {
        Self {
            limit,
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limit.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Configured window.
    #[must_use]
    pub fn window(&self) -> std::time::Duration {
        self.window.to_std().unwrap_or(std::time::Duration::MAX)
    }

    /// Record a hit for `key` at `now` if under the limit. Returns `false` when
    /// the key is saturated; nothing is recorded then.
    pub fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let window = hits.entry(key.to_string()).or_default();
        self.evict(window, now);
        if window.len() >= self.limit as usize {
            if window.is_empty() {
                hits.remove(key);
            }
            return false;
        }
        window.push_back(now);
        true
    }

    /// Give back a hit taken at `at`.
    pub fn refund(&self, key: &str, at: DateTime<Utc>) {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(window) = hits.get_mut(key) {
            if let Some(index) = window.iter().rposition(|hit| *hit == at) {
                window.remove(index);
            }
            if window.is_empty() {
                hits.remove(key);
            }
        }
    }

    /// Hits still available to `key` at `now`.
    #[must_use]
    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let used = hits.get_mut(key).map_or(0, |window| {
            self.evict(window, now);
            window.len()
        });
        if used == 0 {
            hits.remove(key);
        }
        self.limit.saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
    }

    /// Forget every key with no hit left inside the window at `now`.
    /// Returns how many keys were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let before = hits.len();
        hits.retain(|_, window| {
            self.evict(window, now);
            !window.is_empty()
        });
        before - hits.len()
    }

    /// Keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn evict(&self, window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while window.front().is_some_and(|oldest| now - *oldest >= self.window) {
            window.pop_front();
        }
    }
}
