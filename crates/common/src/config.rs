use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DqrError, Result};

/// Transport message-size ceiling used when no byte limit is configured.
pub const DEFAULT_ALL_RESULTS_BYTES_LIMIT: u64 = 64_000_000;
/// Default unacknowledged-bytes window towards an overflow sink.
pub const DEFAULT_OVERFLOW_WINDOW_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Result aggregation behavior/configuration knobs.
pub struct ResultConfig {
    /// Max serialized row bytes kept in the in-memory result payload.
    pub all_results_bytes_limit: u64,
    /// Optional max rows kept in the in-memory result payload.
    pub rows_limit_per_write: Option<u64>,
    /// Spill rows that do not fit the payload to an overflow sink instead of
    /// truncating the result.
    pub enable_full_result_write: bool,
    /// Max bytes in flight (sent but not acknowledged) towards the overflow sink.
    pub overflow_window_bytes: u64,
    /// Root directory for overflow files written by file-backed sinks.
    pub overflow_root: PathBuf,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            all_results_bytes_limit: DEFAULT_ALL_RESULTS_BYTES_LIMIT,
            rows_limit_per_write: None,
            enable_full_result_write: false,
            overflow_window_bytes: DEFAULT_OVERFLOW_WINDOW_BYTES,
            overflow_root: PathBuf::from(".dqr_overflow"),
        }
    }
}

impl ResultConfig {
    /// Build config from defaults overlaid with `DQR_*` environment variables.
    ///
    /// Recognized variables:
    /// - `DQR_ALL_RESULTS_BYTES_LIMIT`
    /// - `DQR_ROWS_LIMIT_PER_WRITE`
    /// - `DQR_ENABLE_FULL_RESULT_WRITE`
    /// - `DQR_OVERFLOW_WINDOW_BYTES`
    /// - `DQR_OVERFLOW_ROOT`
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u64>("DQR_ALL_RESULTS_BYTES_LIMIT")? {
            cfg.all_results_bytes_limit = v;
        }
        if let Some(v) = env_parse::<u64>("DQR_ROWS_LIMIT_PER_WRITE")? {
            cfg.rows_limit_per_write = Some(v);
        }
        if let Some(v) = env_parse::<bool>("DQR_ENABLE_FULL_RESULT_WRITE")? {
            cfg.enable_full_result_write = v;
        }
        if let Some(v) = env_parse::<u64>("DQR_OVERFLOW_WINDOW_BYTES")? {
            cfg.overflow_window_bytes = v;
        }
        if let Ok(v) = env::var("DQR_OVERFLOW_ROOT") {
            cfg.overflow_root = PathBuf::from(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the coordinator cannot make progress with.
    pub fn validate(&self) -> Result<()> {
        if self.all_results_bytes_limit == 0 {
            return Err(DqrError::InvalidConfig(
                "all_results_bytes_limit must be > 0".to_string(),
            ));
        }
        if self.overflow_window_bytes == 0 {
            return Err(DqrError::InvalidConfig(
                "overflow_window_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Payload limits derived from this config.
    #[must_use]
    pub fn limits(&self) -> ResultLimits {
        ResultLimits {
            max_bytes: self.all_results_bytes_limit,
            max_rows: self.rows_limit_per_write,
        }
    }
}

/// Immutable row/byte limits for one coordinator's in-memory payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLimits {
    /// Max accumulated serialized row bytes.
    pub max_bytes: u64,
    /// Max accumulated rows, if limited.
    pub max_rows: Option<u64>,
}

impl Default for ResultLimits {
    fn default() -> Self {
        ResultConfig::default().limits()
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DqrError::InvalidConfig(format!("invalid value for {key}='{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}
