//! Cache configuration with layered loading.
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. TOML config file (if PAGECACHE_CONFIG_FILE set)
//! 3. Environment variables (PAGECACHE_*, `__` separates sections)

use std::collections::BTreeSet;
use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

use crate::model::TrackedFields;
use crate::output::OutputComments;
use crate::recorder::GenerateOptions;
use crate::refresh::RefreshSettings;

/// Complete configuration for recording and refreshing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub generate: GenerateConfig,
    pub refresh: RefreshSettings,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it when set.
    ///
    /// Set via PAGECACHE_LOGGING__LEVEL environment variable.
    pub level: String,

    /// Emit JSON lines instead of compact text.
    ///
    /// Set via PAGECACHE_LOGGING__JSON environment variable.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

/// Where dependency rows and cached output live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite dependency database.
    ///
    /// Set via PAGECACHE_STORAGE__DB_PATH environment variable.
    pub db_path: PathBuf,

    /// Root directory of the file cache store.
    ///
    /// Set via PAGECACHE_STORAGE__FILE_ROOT environment variable.
    pub file_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: PathBuf::from("./pagecache.sqlite"), file_root: PathBuf::from("./storage/pagecache") }
    }
}

/// Recording defaults applied to every render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub caching_enabled: bool,
    pub track_elements: bool,
    pub track_element_queries: bool,

    /// Custom field ids tracked per element; all fields when unset.
    pub track_custom_fields: Option<Vec<i64>>,

    pub output_comments: OutputComments,

    /// Tags added to every saved page.
    pub tags: Vec<String>,

    /// Lifetime of cache entries in seconds; unlimited when unset.
    pub cache_duration_secs: Option<u64>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            track_elements: true,
            track_element_queries: true,
            track_custom_fields: None,
            output_comments: OutputComments::default(),
            tags: Vec::new(),
            cache_duration_secs: None,
        }
    }
}

impl GenerateConfig {
    pub fn tracked_fields(&self) -> TrackedFields {
        match &self.track_custom_fields {
            Some(fields) if !fields.is_empty() => TrackedFields::Only(fields.iter().copied().collect()),
            _ => TrackedFields::All,
        }
    }

    pub fn cache_duration(&self) -> Option<chrono::Duration> {
        self.cache_duration_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }
}

impl From<&GenerateConfig> for GenerateOptions {
    fn from(config: &GenerateConfig) -> Self {
        Self {
            caching_enabled: config.caching_enabled,
            track_elements: config.track_elements,
            track_element_queries: config.track_element_queries,
            track_custom_fields: config.tracked_fields(),
            output_comments: config.output_comments,
            tags: config.tags.iter().filter(|tag| !tag.is_empty()).cloned().collect::<BTreeSet<_>>(),
            cache_duration: config.cache_duration(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("PAGECACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        Self::extract(figment.merge(
            Env::prefixed("PAGECACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        ))
    }

    /// Load from a TOML string layered over the defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions::from(&self.generate)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        self.refresh.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.storage.db_path, PathBuf::from("./pagecache.sqlite"));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.generate.caching_enabled);
        assert_eq!(config.refresh, RefreshSettings::default());
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let config = CacheConfig::from_toml(
            r#"
            [generate]
            track_custom_fields = [3, 4]
            output_comments = "served"
            tags = ["site", ""]
            cache_duration_secs = 600

            [refresh]
            clear_on_refresh = false
            job_threshold = 5
            "#,
        )
        .unwrap();

        let options = config.generate_options();
        assert_eq!(options.track_custom_fields, TrackedFields::Only(BTreeSet::from([3, 4])));
        assert_eq!(options.output_comments, OutputComments::Served);
        assert_eq!(options.tags, BTreeSet::from(["site".to_string()]));
        assert_eq!(options.cache_duration, Some(chrono::Duration::minutes(10)));

        let settings = config.refresh_settings();
        assert!(!settings.clear_on_refresh);
        assert!(settings.batch_mode);
        assert_eq!(settings.job_threshold, 5);
    }

    #[test]
    fn test_unset_fields_track_everything() {
        let options = CacheConfig::default().generate_options();
        assert_eq!(options.track_custom_fields, TrackedFields::All);
        assert!(options.cache_duration.is_none());
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let result = CacheConfig::from_toml("[refresh]\njob_threshold = \"many\"");
        assert!(matches!(result, Err(ConfigError::LoadFailed(_))));
    }
}
