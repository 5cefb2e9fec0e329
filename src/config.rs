//! Server configuration for the query front end
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for `{0}`: {1}")]
    Invalid(&'static str, String),
}

/// Query front end configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Time after collection when samples become visible in query results
    pub latency_offset_ms: i64,
    /// Maximum query length in bytes
    pub max_query_len: usize,
    /// Lookback window used when a request doesn't set `max_lookback`
    pub max_lookback_ms: i64,
    /// Fallback for `max_lookback_ms`
    pub max_staleness_interval_ms: i64,
    /// Addresses of peer query nodes, `host:port`
    pub select_nodes: Vec<String>,
    /// Upper bound for query deadlines
    pub max_query_duration_ms: u64,
    /// Upper bound for export deadlines
    pub max_export_duration_ms: u64,
    /// Default for requests that don't pass `deny_partial_response`
    pub deny_partial_response: bool,
    /// Ceiling on points a single series may produce for a range query
    pub max_points_per_timeseries: i64,
    /// Timeout for cache reset calls to peers
    pub reset_cache_timeout_ms: u64,
    /// Poll interval for live tailing
    pub tail_poll_interval_ms: u64,
    /// Listen address of the Prometheus exporter
    pub metrics_addr: String,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            latency_offset_ms: 30_000,
            max_query_len: 16 * 1024,
            max_lookback_ms: 0,
            max_staleness_interval_ms: 0,
            select_nodes: Vec::new(),
            max_query_duration_ms: 30_000,
            max_export_duration_ms: 30 * 24 * 3600 * 1000,
            deny_partial_response: false,
            max_points_per_timeseries: 30_000,
            reset_cache_timeout_ms: 5_000,
            tail_poll_interval_ms: 1_000,
            metrics_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl SelectConfig {
    /// Loads and validates the configuration stored at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SelectConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_query_len == 0 {
            return Err(ConfigError::Invalid("max_query_len", "must be positive".to_string()));
        }
        if self.tail_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tail_poll_interval_ms",
                "must be positive".to_string(),
            ));
        }
        if self.max_points_per_timeseries <= 0 {
            return Err(ConfigError::Invalid(
                "max_points_per_timeseries",
                self.max_points_per_timeseries.to_string(),
            ));
        }
        if self.latency_offset_ms < 0 {
            return Err(ConfigError::Invalid(
                "latency_offset_ms",
                self.latency_offset_ms.to_string(),
            ));
        }
        Ok(())
    }

    /// Visibility latency in milliseconds, never below one second
    pub fn latency_offset(&self) -> i64 {
        self.latency_offset_ms.max(1000)
    }

    pub fn max_query_duration(&self) -> Duration {
        Duration::from_millis(self.max_query_duration_ms)
    }

    pub fn max_export_duration(&self) -> Duration {
        Duration::from_millis(self.max_export_duration_ms)
    }

    pub fn reset_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_cache_timeout_ms)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }
}
