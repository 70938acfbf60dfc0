//! Runtime configuration from environment variables

use crate::stream_core::{BroadcastConfig, TailOptions};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "Invalid value for {}: {:?}", var, value),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the analytics runtime
///
/// Every variable is optional; unset variables take the defaults below, set
/// but unparsable ones are an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Path to the SQLite database holding the log and snapshot series
    pub db_path: String,

    /// Newest events kept in the log (0 = unbounded)
    pub event_log_max_len: usize,

    /// Max entries per tail read
    pub tail_batch_size: usize,

    /// Max wait per tail read before a heartbeat, in milliseconds
    pub tail_block_ms: u64,

    /// Cross-process poll interval for tail readers, in milliseconds
    pub tail_poll_interval_ms: u64,

    /// Pause after a failed tail read, in milliseconds
    pub broadcast_error_backoff_ms: u64,

    /// Per-subscriber live message buffer
    pub subscriber_channel_buffer: usize,

    /// Newest entries scanned by race and activity reports
    pub race_window_size: usize,

    /// Max first-to-last spread of a race (0 = unbounded)
    pub race_max_spread_ms: i64,

    /// Seconds between periodic reports
    pub report_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "data/detections.db".to_string(),
            event_log_max_len: 10_000,
            tail_batch_size: 10,
            tail_block_ms: 1_000,
            tail_poll_interval_ms: 250,
            broadcast_error_backoff_ms: 1_000,
            subscriber_channel_buffer: 256,
            race_window_size: 1_000,
            race_max_spread_ms: 0,
            report_interval_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DETECTION_DB_PATH` (default: data/detections.db)
    /// - `EVENT_LOG_MAX_LEN` (default: 10000)
    /// - `TAIL_BATCH_SIZE` (default: 10)
    /// - `TAIL_BLOCK_MS` (default: 1000)
    /// - `TAIL_POLL_INTERVAL_MS` (default: 250)
    /// - `BROADCAST_ERROR_BACKOFF_MS` (default: 1000)
    /// - `SUBSCRIBER_CHANNEL_BUFFER` (default: 256)
    /// - `RACE_WINDOW_SIZE` (default: 1000)
    /// - `RACE_MAX_SPREAD_MS` (default: 0)
    /// - `REPORT_INTERVAL_SECS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            db_path: lookup("DETECTION_DB_PATH")
                .filter(|path| !path.trim().is_empty())
                .unwrap_or(defaults.db_path),
            event_log_max_len: parse_var(&lookup, "EVENT_LOG_MAX_LEN", defaults.event_log_max_len)?,
            tail_batch_size: parse_var(&lookup, "TAIL_BATCH_SIZE", defaults.tail_batch_size)?,
            tail_block_ms: parse_var(&lookup, "TAIL_BLOCK_MS", defaults.tail_block_ms)?,
            tail_poll_interval_ms: parse_var(&lookup, "TAIL_POLL_INTERVAL_MS", defaults.tail_poll_interval_ms)?,
            broadcast_error_backoff_ms: parse_var(
                &lookup,
                "BROADCAST_ERROR_BACKOFF_MS",
                defaults.broadcast_error_backoff_ms,
            )?,
            subscriber_channel_buffer: parse_var(
                &lookup,
                "SUBSCRIBER_CHANNEL_BUFFER",
                defaults.subscriber_channel_buffer,
            )?,
            race_window_size: parse_var(&lookup, "RACE_WINDOW_SIZE", defaults.race_window_size)?,
            race_max_spread_ms: parse_var(&lookup, "RACE_MAX_SPREAD_MS", defaults.race_max_spread_ms)?,
            report_interval_secs: parse_var(&lookup, "REPORT_INTERVAL_SECS", defaults.report_interval_secs)?,
        })
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            batch_size: self.tail_batch_size,
            poll_interval: Duration::from_millis(self.tail_poll_interval_ms),
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            batch_size: self.tail_batch_size,
            block: Duration::from_millis(self.tail_block_ms),
            poll_interval: Duration::from_millis(self.tail_poll_interval_ms),
            error_backoff: Duration::from_millis(self.broadcast_error_backoff_ms),
            channel_buffer: self.subscriber_channel_buffer,
        }
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.db_path, "data/detections.db");
        assert_eq!(config.event_log_max_len, 10_000);
        assert_eq!(config.tail_batch_size, 10);
        assert_eq!(config.broadcast_config().block, Duration::from_secs(1));
        assert_eq!(config.broadcast_config().error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_custom_config() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DETECTION_DB_PATH", "/tmp/test.db"),
            ("TAIL_BATCH_SIZE", "25"),
            ("TAIL_POLL_INTERVAL_MS", "50"),
            ("RACE_MAX_SPREAD_MS", " 500 "),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.race_max_spread_ms, 500);
        assert_eq!(config.tail_options().batch_size, 25);
        assert_eq!(config.tail_options().poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_value_is_error() {
        let err = AppConfig::from_lookup(lookup_from(&[("TAIL_BLOCK_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "TAIL_BLOCK_MS",
                value: "soon".to_string()
            }
        );
    }
}
