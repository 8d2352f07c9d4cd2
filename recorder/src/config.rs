//! Configuration management for the Pulse recorder service
//!
//! This module handles loading, parsing, and validating configuration from
//! TOML files and defaults. Invalid values are fatal at startup: the
//! process must not begin sampling with a nonsensical interval or
//! retention horizon.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Main configuration structure for the recorder service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Sampling loop configuration
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Live streaming configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sampling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Interval between ticks in milliseconds
    pub interval_ms: u64,

    /// Stop the loop after this many completed ticks (bounded debug runs
    /// only; production runs leave this unset)
    pub tick_cap: Option<u64>,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Retention horizon in days; rows older than this are trimmed on
    /// every append
    pub history_days: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,
}

/// Live streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Default subscriber history window in seconds
    pub default_history_secs: u64,

    /// Capacity of the new-sample broadcast channel
    pub sample_channel_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            tick_cap: None,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { history_days: 30 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let default_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pulse")
            .join("metrics.db");

        Self { db_path: default_path }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_history_secs: 60,
            sample_channel_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RetentionConfig {
    /// Retention horizon in milliseconds
    pub fn horizon_ms(&self) -> i64 {
        i64::from(self.history_days) * 24 * 3600 * 1000
    }
}

impl RecorderConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string_lossy().to_string(),
        })?;

        let config: RecorderConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        Ok(config)
    }

    /// Default configuration file location
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::ValidationFailed {
            reason: "no configuration directory available on this platform".to_string(),
        })?;

        Ok(config_dir.join("pulse").join("recorder.toml"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sampling.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.interval_ms".to_string(),
                value: self.sampling.interval_ms.to_string(),
            });
        }

        if let Some(cap) = self.sampling.tick_cap {
            if cap == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "sampling.tick_cap".to_string(),
                    value: cap.to_string(),
                });
            }
        }

        if self.retention.history_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retention.history_days".to_string(),
                value: self.retention.history_days.to_string(),
            });
        }

        if self.stream.default_history_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream.default_history_secs".to_string(),
                value: self.stream.default_history_secs.to_string(),
            });
        }

        if self.stream.sample_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream.sample_channel_capacity".to_string(),
                value: self.stream.sample_channel_capacity.to_string(),
            });
        }

        // Subscriber windows must never describe more history than the
        // store retains.
        let retained_secs = u64::from(self.retention.history_days) * 24 * 3600;
        if self.stream.default_history_secs > retained_secs {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "stream.default_history_secs ({}) exceeds retained history ({} seconds)",
                    self.stream.default_history_secs, retained_secs
                ),
            });
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: other.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.interval_ms, 1000);
        assert_eq!(config.retention.history_days, 30);
        assert_eq!(config.stream.default_history_secs, 60);
        assert!(config.sampling.tick_cap.is_none());
    }

    #[test]
    fn test_horizon_conversion() {
        let retention = RetentionConfig { history_days: 30 };
        assert_eq!(retention.horizon_ms(), 30 * 24 * 3600 * 1000);

        let retention = RetentionConfig { history_days: 1 };
        assert_eq!(retention.horizon_ms(), 86_400_000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = RecorderConfig::default();
        config.sampling.interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "sampling.interval_ms"));
    }

    #[test]
    fn test_zero_history_rejected() {
        let mut config = RecorderConfig::default();
        config.retention.history_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_default_window_rejected() {
        let mut config = RecorderConfig::default();
        config.retention.history_days = 1;
        config.stream.default_history_secs = 2 * 24 * 3600;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = RecorderConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[sampling]\ninterval_ms = 250\n\n[retention]\nhistory_days = 7\n"
        )
        .unwrap();

        let config = RecorderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sampling.interval_ms, 250);
        assert_eq!(config.retention.history_days, 7);
        // Untouched sections fall back to defaults
        assert_eq!(config.stream.default_history_secs, 60);
    }

    #[test]
    fn test_from_file_missing() {
        let err = RecorderConfig::from_file("/nonexistent/pulse.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_from_file_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sampling\ninterval_ms = ").unwrap();
        let err = RecorderConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
