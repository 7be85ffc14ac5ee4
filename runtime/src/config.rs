//! Engine configuration.
//!
//! Loads configuration from `QUEUE_*` environment variables with sensible
//! defaults. Unparseable values fall back to the default.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Token secret used when `QUEUE_TOKEN_SECRET` is unset. Fine for tests, not for
/// anything that hands tokens to clients.
pub const DEVELOPMENT_TOKEN_SECRET: &str = "queueline-development-secret";

/// Policy knobs for the queue engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minutes after creation during which a client may cancel (default: 30)
    pub client_cancellation_window_minutes: u64,
    /// Whether clients may cancel their own tickets at all (default: true)
    pub allow_client_cancellation: bool,
    /// Client cancellations allowed per source per window (default: 5)
    pub cancellation_rate_limit: u32,
    /// Rate limit window in minutes (default: 10)
    pub cancellation_rate_window_minutes: u64,
    /// Lifetime of a per-ticket cancellation lock in seconds (default: 30)
    pub cancellation_lock_ttl_secs: u64,
    /// Minutes a called ticket may wait for staff before the sweep cancels it (default: 15)
    pub call_timeout_minutes: u64,
    /// Offset of local time from UTC in minutes, for hours and daily rollover (default: 0)
    pub utc_offset_minutes: i32,
    /// Secret mixed into security tokens
    pub token_secret: String,
    /// Short code generation attempts before giving up (default: 10)
    pub short_code_attempts: u32,
    /// Reference suffix attempts before giving up (default: 10)
    pub reference_attempts: u32,
    /// Attempts for `call_next` when another terminal calls the same ticket (default: 5)
    pub call_next_attempts: u32,
    /// Waiting tickets listed in a queue snapshot (default: 10)
    pub queue_preview_len: usize,
    /// Upper bound on a notifier or auditor call in milliseconds (default: 5000)
    pub side_effect_timeout_ms: u64,
    /// Delay before the single retry of a transient store failure in milliseconds (default: 25)
    pub retry_delay_ms: u64,
    /// Housekeeping interval in seconds (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Logs a warning when no token secret is configured.
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self::from_lookup(|key| env::var(key).ok());
        if config.uses_development_secret() {
            tracing::warn!(variable = "QUEUE_TOKEN_SECRET", "token_secret_defaulted");
        }
        config
    }

    /// Whether security tokens are derived from [`DEVELOPMENT_TOKEN_SECRET`].
    #[must_use]
    pub fn uses_development_secret(&self) -> bool {
        self.token_secret == DEVELOPMENT_TOKEN_SECRET
    }

    /// Load configuration through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        Self {
            client_cancellation_window_minutes: parsed(&lookup, "QUEUE_CLIENT_CANCELLATION_WINDOW_MINUTES", 30),
            allow_client_cancellation: parsed(&lookup, "QUEUE_ALLOW_CLIENT_CANCELLATION", true),
            cancellation_rate_limit: parsed(&lookup, "QUEUE_CANCELLATION_RATE_LIMIT", 5),
            cancellation_rate_window_minutes: parsed(&lookup, "QUEUE_CANCELLATION_RATE_WINDOW_MINUTES", 10),
            cancellation_lock_ttl_secs: parsed(&lookup, "QUEUE_CANCELLATION_LOCK_TTL_SECS", 30),
            call_timeout_minutes: parsed(&lookup, "QUEUE_CALL_TIMEOUT_MINUTES", 15),
            utc_offset_minutes: parsed(&lookup, "QUEUE_UTC_OFFSET_MINUTES", 0),
            token_secret: lookup("QUEUE_TOKEN_SECRET").unwrap_or_else(|| DEVELOPMENT_TOKEN_SECRET.to_string()),
            short_code_attempts: parsed(&lookup, "QUEUE_SHORT_CODE_ATTEMPTS", 10),
            reference_attempts: parsed(&lookup, "QUEUE_REFERENCE_ATTEMPTS", 10),
            call_next_attempts: parsed(&lookup, "QUEUE_CALL_NEXT_ATTEMPTS", 5),
            queue_preview_len: parsed(&lookup, "QUEUE_PREVIEW_LEN", 10),
            side_effect_timeout_ms: parsed(&lookup, "QUEUE_SIDE_EFFECT_TIMEOUT_MS", 5000),
            retry_delay_ms: parsed(&lookup, "QUEUE_RETRY_DELAY_MS", 25),
            sweep_interval_secs: parsed(&lookup, "QUEUE_SWEEP_INTERVAL_SECS", 60),
        }
    }

    /// Client cancellation window.
    #[must_use]
    pub const fn client_cancellation_window(&self) -> Duration {
        Duration::from_secs(self.client_cancellation_window_minutes.saturating_mul(60))
    }

    /// Rate limit window.
    #[must_use]
    pub const fn cancellation_rate_window(&self) -> Duration {
        Duration::from_secs(self.cancellation_rate_window_minutes.saturating_mul(60))
    }

    /// Cancellation lock lifetime.
    #[must_use]
    pub const fn cancellation_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.cancellation_lock_ttl_secs)
    }

    /// Call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_minutes.saturating_mul(60))
    }

    /// Side-effect timeout.
    #[must_use]
    pub const fn side_effect_timeout(&self) -> Duration {
        Duration::from_millis(self.side_effect_timeout_ms)
    }

    /// Housekeeping interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Local time zone as a fixed offset. Out-of-range offsets fall back to UTC.
    #[must_use]
    pub fn local_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.client_cancellation_window(), Duration::from_secs(30 * 60));
        assert_eq!(config.cancellation_rate_limit, 5);
        assert_eq!(config.cancellation_rate_window(), Duration::from_secs(600));
        assert_eq!(config.cancellation_lock_ttl(), Duration::from_secs(30));
        assert_eq!(config.call_timeout(), Duration::from_secs(15 * 60));
        assert_eq!(config.short_code_attempts, 10);
        assert!(config.allow_client_cancellation);
        assert_eq!(config.local_offset().local_minus_utc(), 0);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("QUEUE_CLIENT_CANCELLATION_WINDOW_MINUTES", "45"),
            ("QUEUE_ALLOW_CLIENT_CANCELLATION", "false"),
            ("QUEUE_CANCELLATION_RATE_LIMIT", "lots"),
            ("QUEUE_UTC_OFFSET_MINUTES", "-300"),
            ("QUEUE_TOKEN_SECRET", "s3cret"),
        ]));
        assert_eq!(config.client_cancellation_window_minutes, 45);
        assert!(!config.allow_client_cancellation);
        assert_eq!(config.cancellation_rate_limit, 5);
        assert_eq!(config.local_offset().local_minus_utc(), -300 * 60);
        assert_eq!(config.token_secret, "s3cret");
        assert!(!config.uses_development_secret());
    }

    #[test]
    fn missing_secret_is_flagged() {
        let config = EngineConfig::from_lookup(lookup(&[("QUEUE_SWEEP_INTERVAL_SECS", "5")]));
        assert!(config.uses_development_secret());
        assert_eq!(config.token_secret, DEVELOPMENT_TOKEN_SECRET);
    }

    #[test]
    fn absurd_offset_falls_back_to_utc() {
        let config = EngineConfig {
            utc_offset_minutes: 100_000,
            ..EngineConfig::default()
        };
        assert_eq!(config.local_offset().local_minus_utc(), 0);
    }
}
