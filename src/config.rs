//! Pipeline configuration.
//!
//! All quality thresholds and retry limits live here as configuration, not
//! constants; the source material never reconciled its default values, so
//! deployments are expected to tune them. Defaults come from
//! [`crate::workflow::Thresholds`] and the environment, with optional YAML
//! overrides for the threshold block.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::workflow::Thresholds;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading an overrides file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error in an overrides file.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Quality-gate thresholds and retry bounds.
    pub thresholds: Thresholds,

    // Stage execution settings
    /// Transient-failure retries per stage, independent of quality retries.
    pub stage_retry_limit: u32,
    /// Base delay for exponential stage-retry backoff.
    pub retry_backoff: Duration,
    /// Per-stage execution timeout; expiry is a stage execution error.
    pub stage_timeout: Duration,

    // LLM settings
    /// Temperature for synthesis generation.
    pub temperature: f64,

    // Housekeeping
    /// Age after which an abandoned pending interrupt may be swept.
    pub interrupt_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),

            // Stage execution defaults
            stage_retry_limit: 2,
            retry_backoff: Duration::from_millis(200),
            stage_timeout: Duration::from_secs(120),

            // LLM defaults
            temperature: 0.3,

            // Housekeeping defaults
            interrupt_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Threshold overrides loaded from a YAML file.
#[derive(Debug, Default, Deserialize)]
pub struct ThresholdOverrides {
    pub quality_threshold: Option<f64>,
    pub coverage_threshold: Option<f64>,
    pub min_result_count: Option<usize>,
    pub max_results: Option<usize>,
    pub max_retries: Option<u32>,
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FLOWFORGE_QUALITY_THRESHOLD`: minimum quality score (default: 0.6)
    /// - `FLOWFORGE_COVERAGE_THRESHOLD`: minimum coverage (default: 0.5)
    /// - `FLOWFORGE_MIN_RESULT_COUNT`: minimum ranked documents (default: 3)
    /// - `FLOWFORGE_MAX_RESULTS`: documents carried into synthesis (default: 10)
    /// - `FLOWFORGE_MAX_RETRIES`: quality rewinds per target (default: 2)
    /// - `FLOWFORGE_STAGE_RETRY_LIMIT`: transient retries per stage (default: 2)
    /// - `FLOWFORGE_RETRY_BACKOFF_MS`: base backoff in ms (default: 200)
    /// - `FLOWFORGE_STAGE_TIMEOUT_SECS`: per-stage timeout (default: 120)
    /// - `FLOWFORGE_TEMPERATURE`: synthesis temperature (default: 0.3)
    /// - `FLOWFORGE_INTERRUPT_TTL_SECS`: abandoned-interrupt TTL (default: 86400)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a set variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FLOWFORGE_QUALITY_THRESHOLD") {
            config.thresholds.quality_threshold =
                parse_env_value(&val, "FLOWFORGE_QUALITY_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_COVERAGE_THRESHOLD") {
            config.thresholds.coverage_threshold =
                parse_env_value(&val, "FLOWFORGE_COVERAGE_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_MIN_RESULT_COUNT") {
            config.thresholds.min_result_count =
                parse_env_value(&val, "FLOWFORGE_MIN_RESULT_COUNT")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_MAX_RESULTS") {
            config.thresholds.max_results = parse_env_value(&val, "FLOWFORGE_MAX_RESULTS")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_MAX_RETRIES") {
            config.thresholds.max_retries = parse_env_value(&val, "FLOWFORGE_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_STAGE_RETRY_LIMIT") {
            config.stage_retry_limit = parse_env_value(&val, "FLOWFORGE_STAGE_RETRY_LIMIT")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "FLOWFORGE_RETRY_BACKOFF_MS")?;
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("FLOWFORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FLOWFORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("FLOWFORGE_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "FLOWFORGE_TEMPERATURE")?;
        }
        if let Ok(val) = std::env::var("FLOWFORGE_INTERRUPT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "FLOWFORGE_INTERRUPT_TTL_SECS")?;
            config.interrupt_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Applies threshold overrides from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// resulting configuration is invalid.
    pub fn with_overrides_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let overrides: ThresholdOverrides = serde_yaml::from_str(&contents)?;
        self.apply_overrides(overrides);
        self.validate()?;
        Ok(self)
    }

    /// Applies in-memory overrides.
    pub fn apply_overrides(&mut self, overrides: ThresholdOverrides) {
        if let Some(v) = overrides.quality_threshold {
            self.thresholds.quality_threshold = v;
        }
        if let Some(v) = overrides.coverage_threshold {
            self.thresholds.coverage_threshold = v;
        }
        if let Some(v) = overrides.min_result_count {
            self.thresholds.min_result_count = v;
        }
        if let Some(v) = overrides.max_results {
            self.thresholds.max_results = v;
        }
        if let Some(v) = overrides.max_retries {
            self.thresholds.max_retries = v;
        }
    }

    /// Validates configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns `ValidationFailed` with a description of the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.thresholds.quality_threshold) {
            return Err(ConfigError::ValidationFailed(
                "quality_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.thresholds.coverage_threshold) {
            return Err(ConfigError::ValidationFailed(
                "coverage_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.thresholds.max_results == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_results must be positive".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be in [0, 2]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an environment variable value with a typed error.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
