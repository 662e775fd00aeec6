//! Run configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};
use crate::retry::BackoffPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default endpoint for `idfa` devices.
pub const DEFAULT_IDFA_ADDRESS: &str = "127.0.0.1:33013";

/// Default endpoint for `gaid` devices.
pub const DEFAULT_GAID_ADDRESS: &str = "127.0.0.1:33014";

/// Default endpoint for `adid` devices.
pub const DEFAULT_ADID_ADDRESS: &str = "127.0.0.1:33015";

/// Default endpoint for `dvid` devices.
pub const DEFAULT_DVID_ADDRESS: &str = "127.0.0.1:33016";

/// File name regex used when no pattern is given.
pub const DEFAULT_FILE_REGEX: &str = ".*.tsv.gz";

/// Environment variable naming the directory searched by default.
pub const SOURCE_DIR_ENV: &str = "MEMC_LOAD_DIR";

/// Runs at or above this error rate are declared failed.
pub const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.01;

pub const DEFAULT_WORKERS: usize = 5;

/// Capacity of both the job queue and the outcome queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Memcached connect/read/write timeout in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Everything one run needs, built once and shared read-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Device type to `host:port`
    pub device_endpoints: BTreeMap<String, String>,
    /// `<dir>/<file name regex>`
    pub pattern: String,
    pub dry_run: bool,
    pub error_rate_threshold: f64,
    pub workers: usize,
    pub rename_on_success: bool,
    pub queue_capacity: usize,
    pub io_timeout_ms: u64,
    pub retry: BackoffPolicy,
    /// Exit non-zero when the error-rate gate fails
    pub strict_exit: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            device_endpoints: default_endpoints(),
            pattern: default_pattern(),
            dry_run: false,
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
            workers: DEFAULT_WORKERS,
            rename_on_success: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            retry: BackoffPolicy::default(),
            strict_exit: false,
        }
    }
}

impl LoadConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(LoadError::config("workers must be greater than 0"));
        }

        if self.queue_capacity == 0 {
            return Err(LoadError::config("queue_capacity must be greater than 0"));
        }

        if self.pattern.trim().is_empty() {
            return Err(LoadError::config("file pattern cannot be empty"));
        }

        if !self.error_rate_threshold.is_finite() || !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(LoadError::config(format!(
                "error rate threshold must be within [0, 1], got {}",
                self.error_rate_threshold
            )));
        }

        for (device_type, address) in &self.device_endpoints {
            if device_type.trim().is_empty() {
                return Err(LoadError::config("device type cannot be empty"));
            }
            if address.trim().is_empty() {
                return Err(LoadError::config(format!(
                    "no address configured for device type '{}'",
                    device_type
                )));
            }
        }

        if self.device_endpoints.is_empty() {
            tracing::warn!("No device endpoints configured - every line will be counted as an error");
        }

        Ok(())
    }
}

/// The four standard device types on consecutive local ports
pub fn default_endpoints() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("idfa".to_string(), DEFAULT_IDFA_ADDRESS.to_string()),
        ("gaid".to_string(), DEFAULT_GAID_ADDRESS.to_string()),
        ("adid".to_string(), DEFAULT_ADID_ADDRESS.to_string()),
        ("dvid".to_string(), DEFAULT_DVID_ADDRESS.to_string()),
    ])
}

/// `$MEMC_LOAD_DIR/.*.tsv.gz`, or the current directory when unset
pub fn default_pattern() -> String {
    let dir = std::env::var(SOURCE_DIR_ENV)
        .ok()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| ".".to_string());
    format!("{}/{}", dir.trim_end_matches('/'), DEFAULT_FILE_REGEX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoadConfig::default();

        assert_eq!(config.workers, 5);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.error_rate_threshold, 0.01);
        assert_eq!(config.device_endpoints["idfa"], "127.0.0.1:33013");
        assert_eq!(config.device_endpoints["dvid"], "127.0.0.1:33016");
        assert!(config.pattern.ends_with("/.*.tsv.gz"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let zero_workers = LoadConfig {
            workers: 0,
            ..LoadConfig::default()
        };
        assert!(matches!(zero_workers.validate(), Err(LoadError::Config(_))));

        let zero_queue = LoadConfig {
            queue_capacity: 0,
            ..LoadConfig::default()
        };
        assert!(zero_queue.validate().is_err());

        let threshold = LoadConfig {
            error_rate_threshold: 1.5,
            ..LoadConfig::default()
        };
        assert!(threshold.validate().is_err());

        let nan = LoadConfig {
            error_rate_threshold: f64::NAN,
            ..LoadConfig::default()
        };
        assert!(nan.validate().is_err());

        let mut no_address = LoadConfig::default();
        no_address.device_endpoints.insert("idfa".to_string(), " ".to_string());
        assert!(no_address.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = LoadConfig {
            dry_run: true,
            workers: 8,
            ..LoadConfig::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let back: LoadConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
