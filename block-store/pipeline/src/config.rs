use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_STALL_BUDGET: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_REQUEST_SIZE: usize = 100;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Accumulated payload bytes at which the batch is written to the
    /// repository.
    pub flush_threshold_bytes: NonZeroUsize,
    /// Consecutive fetches without progress tolerated before a pass stalls.
    pub stall_budget: NonZeroUsize,
    /// How long a single batched fetch may wait for peers.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Maximum number of positions asked for in one fetch. This also bounds
    /// how far ahead a single pass walks once blocks must come from the
    /// network.
    pub max_request_size: NonZeroUsize,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: NonZeroUsize::new(DEFAULT_FLUSH_THRESHOLD_BYTES)
                .unwrap_or(NonZeroUsize::MIN),
            stall_budget: NonZeroUsize::new(DEFAULT_STALL_BUDGET).unwrap_or(NonZeroUsize::MIN),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_request_size: NonZeroUsize::new(DEFAULT_MAX_REQUEST_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Delay between a stalled pass and its retry. Doubles on every consecutive
/// stall up to `max`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max: Duration,
}

impl BackoffConfig {
    /// Delay before the retry following `consecutive_stalls` stalled passes
    /// (counting from 1).
    #[must_use]
    pub fn delay(&self, consecutive_stalls: u32) -> Duration {
        let exponent = consecutive_stalls.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            "flush_threshold_bytes: 1000\nrequest_timeout: 250\nbackoff:\n  max: 2000\n",
        )
        .unwrap();

        assert_eq!(config.flush_threshold_bytes.get(), 1000);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.stall_budget.get(), DEFAULT_STALL_BUDGET);
        assert_eq!(config.max_request_size.get(), DEFAULT_MAX_REQUEST_SIZE);
        assert_eq!(
            config.backoff.initial,
            Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS)
        );
        assert_eq!(config.backoff.max, Duration::from_secs(2));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let result = serde_json::from_str::<Config>(r#"{"flush_threshold_bytes": 0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["request_timeout"], DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(json["backoff"]["initial"], DEFAULT_BACKOFF_INITIAL_MS);
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(350));
    }
}
