//! Configuration validation rules.
//!
//! Applied to `CacheConfig` after it has been loaded from environment,
//! files, or defaults.

use crate::config::CacheConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if a storage path is empty, and
    /// `ConfigError::Invalid` if:
    /// - `logging.level` is empty
    /// - `generate.track_custom_fields` is an empty list
    /// - `generate.cache_duration_secs` is 0
    /// - `refresh.job_threshold` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "storage.db_path".into(),
                hint: "Set PAGECACHE_STORAGE__DB_PATH environment variable".into(),
            });
        }
        if self.storage.file_root.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "storage.file_root".into(),
                hint: "Set PAGECACHE_STORAGE__FILE_ROOT environment variable".into(),
            });
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "logging.level".into(), reason: "must not be empty".into() });
        }

        if self.generate.track_custom_fields.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::Invalid {
                field: "generate.track_custom_fields".into(),
                reason: "must list at least one field id, or be unset to track all fields".into(),
            });
        }

        if self.generate.cache_duration_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "generate.cache_duration_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.generate.cache_duration().is_none() && self.generate.cache_duration_secs.is_some() {
            return Err(ConfigError::Invalid {
                field: "generate.cache_duration_secs".into(),
                reason: "is out of range".into(),
            });
        }

        if self.refresh.job_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "refresh.job_threshold".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
