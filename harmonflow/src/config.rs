//! Engine configuration.
//!
//! Directory layout, resolution limits and timeouts. Values come from
//! defaults, a YAML/JSON document, or conventional environment overrides.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables consulted for directory overrides.
pub const ENV_DATA_DIR: &str = "DATA_DIR";
/// Cache directory override.
pub const ENV_CACHE_DIR: &str = "CACHE_DIR";
/// Output directory override.
pub const ENV_OUTPUT_DIR: &str = "OUTPUT_DIR";
/// Config directory override.
pub const ENV_CONFIG_DIR: &str = "CONFIG_DIR";
/// Base directory override.
pub const ENV_BASE_DIR: &str = "BASE_DIR";

/// Source of environment variables.
///
/// Resolution reads the environment through this trait so tests can supply a
/// fixed map instead of mutating the process environment.
pub trait EnvSource: Send + Sync + fmt::Debug {
    /// Returns the value of `key`, if set.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed, in-memory environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("configs")
}

const fn default_max_substitution_passes() -> usize {
    10
}

const fn default_validate_eagerly() -> bool {
    true
}

/// Configuration for the pipeline engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory relative input paths are resolved against.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Primary data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Cache directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Root for every output path.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory holding pipeline definitions.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Further data directories searched after `data_dir`.
    #[serde(default)]
    pub extra_data_dirs: Vec<PathBuf>,
    /// Maximum nested substitution passes per value.
    #[serde(default = "default_max_substitution_passes")]
    pub max_substitution_passes: usize,
    /// Pipeline-level timeout applied to each step's deadline.
    #[serde(default)]
    pub pipeline_timeout_seconds: Option<f64>,
    /// Check every step's operation type before running anything.
    #[serde(default = "default_validate_eagerly")]
    pub validate_operations_eagerly: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            data_dir: default_data_dir(),
            cache_dir: default_cache_dir(),
            output_dir: default_output_dir(),
            config_dir: default_config_dir(),
            extra_data_dirs: Vec::new(),
            max_substitution_passes: default_max_substitution_passes(),
            pipeline_timeout_seconds: None,
            validate_operations_eagerly: default_validate_eagerly(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let mut config = Self::default();
        if let Some(dir) = env.get(ENV_BASE_DIR) {
            config.base_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.get(ENV_CACHE_DIR) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.get(ENV_OUTPUT_DIR) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.get(ENV_CONFIG_DIR) {
            config.config_dir = PathBuf::from(dir);
        }
        config
    }

    /// Parses a configuration from YAML.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(source)
            .map_err(|e| ConfigurationError::new(format!("invalid engine config: {e}")))
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(source)
            .map_err(|e| ConfigurationError::new(format!("invalid engine config: {e}")))
    }

    /// Sets the base directory.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Sets the primary data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Adds a further data directory.
    #[must_use]
    pub fn with_extra_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_data_dirs.push(dir.into());
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the pipeline timeout.
    #[must_use]
    pub fn with_pipeline_timeout_seconds(mut self, seconds: f64) -> Self {
        self.pipeline_timeout_seconds = Some(seconds);
        self
    }

    /// Sets the substitution pass limit.
    #[must_use]
    pub fn with_max_substitution_passes(mut self, passes: usize) -> Self {
        self.max_substitution_passes = passes;
        self
    }

    /// Enables or disables eager operation-type checking.
    #[must_use]
    pub fn with_eager_validation(mut self, eager: bool) -> Self {
        self.validate_operations_eagerly = eager;
        self
    }

    /// Returns the pipeline timeout, if one is configured and positive.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_seconds.and_then(timeout_from_secs)
    }

    /// Data directories in search order.
    #[must_use]
    pub fn data_search_dirs(&self) -> Vec<PathBuf> {
        std::iter::once(self.data_dir.clone())
            .chain(self.extra_data_dirs.iter().cloned())
            .collect()
    }

    /// Fallback values for `${env.*}` lookups of unset variables.
    #[must_use]
    pub fn env_defaults(&self) -> HashMap<String, String> {
        [
            (ENV_DATA_DIR, &self.data_dir),
            (ENV_CACHE_DIR, &self.cache_dir),
            (ENV_OUTPUT_DIR, &self.output_dir),
            (ENV_CONFIG_DIR, &self.config_dir),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.display().to_string()))
        .collect()
    }
}

/// Converts a configured timeout to a duration.
///
/// Non-positive, non-finite and unrepresentable values mean no timeout.
pub(crate) fn timeout_from_secs(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_substitution_passes, 10);
        assert!(config.validate_operations_eagerly);
        assert!(config.pipeline_timeout().is_none());
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_from_env_overrides() {
        let env = MapEnv::new()
            .with("DATA_DIR", "/srv/data")
            .with("OUTPUT_DIR", "/srv/out");
        let config = EngineConfig::from_env(&env);

        assert_eq!(config.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(config.cache_dir, PathBuf::from("cache"));
    }

    #[test]
    fn test_env_defaults_table() {
        let config = EngineConfig::default().with_data_dir("/d");
        let defaults = config.env_defaults();

        assert_eq!(defaults.get("DATA_DIR").map(String::as_str), Some("/d"));
        assert!(defaults.contains_key("CACHE_DIR"));
        assert!(defaults.contains_key("OUTPUT_DIR"));
        assert!(!defaults.contains_key("HOME"));
    }

    #[test]
    fn test_from_yaml_fills_defaults() {
        let config = EngineConfig::from_yaml_str(
            "data_dir: /mnt/data\npipeline_timeout_seconds: 2.5\n",
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/mnt/data"));
        assert_eq!(config.pipeline_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.max_substitution_passes, 10);
    }

    #[test]
    fn test_from_json_rejects_bad_types() {
        let err = EngineConfig::from_json_str(r#"{"max_substitution_passes": "ten"}"#)
            .unwrap_err();
        assert!(err.message.contains("invalid engine config"));
    }

    #[test]
    fn test_search_dirs_order() {
        let config = EngineConfig::default()
            .with_data_dir("/a")
            .with_extra_data_dir("/b");
        assert_eq!(
            config.data_search_dirs(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_non_positive_timeout_is_ignored() {
        let config = EngineConfig::default().with_pipeline_timeout_seconds(0.0);
        assert!(config.pipeline_timeout().is_none());
        let config = EngineConfig::default().with_pipeline_timeout_seconds(f64::NAN);
        assert!(config.pipeline_timeout().is_none());
    }

    #[test]
    fn test_oversized_timeout_is_ignored() {
        let config = EngineConfig::default().with_pipeline_timeout_seconds(1.0e20);
        assert!(config.pipeline_timeout().is_none());
        assert!(timeout_from_secs(f64::INFINITY).is_none());
        assert_eq!(timeout_from_secs(0.5), Some(Duration::from_millis(500)));
    }
}
