//! Orchestrator configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATEBUS_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use statebus_core::DEFAULT_MAX_MICROSTEPS;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Machines processed in parallel.
    pub pool_size: usize,
    /// Per-machine queue capacity (0 = unbounded).
    pub queue_capacity: usize,
    /// How long dispose waits for an in-flight macrostep, in milliseconds.
    pub dispose_timeout_ms: u64,
    /// Process entries queued ahead of a dispose before disposing.
    pub drain_on_dispose: bool,
    /// Microstep bound handed to every interpreter.
    pub max_microsteps: usize,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 0,
            dispose_timeout_ms: 5000,
            drain_on_dispose: true,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            metrics: MetricsConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from STATEBUS_CONFIG (if set), then applies
    /// environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("STATEBUS_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads configuration from an optional file, then applies environment
    /// variable overrides and validates.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("STATEBUS_POOL_SIZE") {
            self.pool_size = n;
        }
        if let Some(n) = env_parse("STATEBUS_QUEUE_CAPACITY") {
            self.queue_capacity = n;
        }
        if let Some(ms) = env_parse("STATEBUS_DISPOSE_TIMEOUT_MS") {
            self.dispose_timeout_ms = ms;
        }
        if let Some(drain) = env_flag("STATEBUS_DRAIN_ON_DISPOSE") {
            self.drain_on_dispose = drain;
        }
        if let Some(n) = env_parse("STATEBUS_MAX_MICROSTEPS") {
            self.max_microsteps = n;
        }
        self.metrics.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Validation("pool_size must be at least 1".to_string()));
        }
        if self.max_microsteps == 0 {
            return Err(ConfigError::Validation(
                "max_microsteps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Returns the dispose timeout as Duration.
    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record prometheus metrics.
    pub enabled: bool,
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("STATEBUS_METRICS_ENABLED") {
            self.enabled = enabled;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
