// src/config.rs

use std::time::Duration;

use rand::Rng;

use crate::ParseError;

/// Environment variable read by [`LiveQueryConfig::from_env`].
pub const MAX_CONNECTION_ATTEMPTS_ENV: &str = "PARSE_LIVE_QUERY_MAX_CONNECTION_ATTEMPTS";

/// Reconnection settings for a [`ParseLiveQuery`](crate::ParseLiveQuery) client.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveQueryConfig {
    /// Number of consecutive failed reconnects after which the client stops retrying.
    /// The counter resets on every successful `connected` handshake.
    pub max_connection_attempts: usize,
    /// Unit of the exponential backoff. Attempt `n` waits a random duration below
    /// `reconnect_base * (2^n - 1)`.
    pub reconnect_base: Duration,
    /// Upper bound of the backoff window.
    pub reconnect_max: Duration,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            max_connection_attempts: 20,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl LiveQueryConfig {
    /// Defaults, with `max_connection_attempts` overridden by
    /// `PARSE_LIVE_QUERY_MAX_CONNECTION_ATTEMPTS` when it is set.
    pub fn from_env() -> Result<Self, ParseError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(MAX_CONNECTION_ATTEMPTS_ENV) {
            config.max_connection_attempts = raw.trim().parse().map_err(|_| {
                ParseError::InvalidInput(format!(
                    "{} must be a non-negative integer, got '{}'",
                    MAX_CONNECTION_ATTEMPTS_ENV, raw
                ))
            })?;
        }
        Ok(config)
    }

    pub fn max_connection_attempts(mut self, attempts: usize) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max.max(base);
        self
    }

    /// Delay before reconnect attempt number `attempts`.
    pub fn reconnect_interval(&self, attempts: usize) -> Duration {
        let exponent = attempts.min(31) as u32;
        let window = self
            .reconnect_base
            .saturating_mul((1u32 << exponent).saturating_sub(1))
            .min(self.reconnect_max);
        if window.is_zero() {
            return Duration::ZERO;
        }
        let millis = window.as_millis().min(u64::MAX as u128) as u64;
        if millis == 0 {
            return window;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_interval_stays_within_window() {
        let config = LiveQueryConfig::default()
            .reconnect_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(config.reconnect_interval(0), Duration::ZERO);
        for attempts in 1..40 {
            let delay = config.reconnect_interval(attempts);
            assert!(delay < Duration::from_millis(500), "attempt {attempts}: {delay:?}");
        }
        for _ in 0..50 {
            assert!(config.reconnect_interval(1) < Duration::from_millis(100));
        }
    }

    #[test]
    fn backoff_max_never_below_base() {
        let config = LiveQueryConfig::default()
            .reconnect_backoff(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(2));
    }
}
