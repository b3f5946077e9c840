//! Orchestrator Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/orchestrator.toml` (base configuration)
//! 2. Environment variables (prefixed with `LABORCH_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LABORCH_APPLICATION__LOG_LEVEL=debug
//! LABORCH_SCHEDULER__SOURCE_PLATE_CEILING=4
//! LABORCH_EXECUTOR__SHUTDOWN_TIMEOUT_MS=2000
//! ```
//!
//! Every section has defaults, so a missing or empty file yields a usable configuration.
//!
//! # Example
//!
//! ```no_run
//! use lab_orchestrator::config::OrchestratorConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::load()?;
//!     println!("Application: {}", config.application.name);
//!     println!("Source ceiling: {}", config.scheduler.source_plate_ceiling);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::RetryPolicy;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is outside its allowed range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Plate scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-device executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Automated error recovery
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Plate scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of live source plates
    #[serde(default = "default_source_ceiling")]
    pub source_plate_ceiling: usize,
    /// Maximum number of live destination plates
    #[serde(default = "default_destination_ceiling")]
    pub destination_plate_ceiling: usize,
    /// Delay between scheduling passes in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// How long `stop` waits for the in-flight workflow before aborting it, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// Automated error recovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retries granted to each failing step before the workflow aborts
    #[serde(default)]
    pub max_auto_retries: u32,
    /// Delay before each automatic retry in milliseconds
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "Lab Orchestrator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_ceiling() -> usize {
    3
}

fn default_destination_ceiling() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    5000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            source_plate_ceiling: default_source_ceiling(),
            destination_plate_ceiling: default_destination_ceiling(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// Delay between scheduling passes.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RecoveryConfig {
    /// Automated error reporter for this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_backoff(
            self.max_auto_retries,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl OrchestratorConfig {
    /// Load configuration from `config/orchestrator.toml` and environment variables
    ///
    /// Environment variables (`LABORCH_` prefix) take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the configuration cannot be loaded or fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/orchestrator.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or the result is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABORCH_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Plate ceilings are non-zero
    /// - Poll interval and shutdown timeout are non-zero
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.scheduler.source_plate_ceiling == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.source_plate_ceiling must be > 0".to_string(),
            ));
        }
        if self.scheduler.destination_plate_ceiling == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.destination_plate_ceiling must be > 0".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.executor.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "executor.shutdown_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.scheduler.source_plate_ceiling, 3);
        assert_eq!(config.scheduler.destination_plate_ceiling, 2);
        assert_eq!(config.executor.shutdown_timeout_ms, 5000);
        assert_eq!(config.recovery.max_auto_retries, 0);
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
[application]
log_level = "debug"

[scheduler]
source_plate_ceiling = 5
"#,
        );
        let config = OrchestratorConfig::load_from(file.path()).expect("loads");
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "Lab Orchestrator");
        assert_eq!(config.scheduler.source_plate_ceiling, 5);
        assert_eq!(config.scheduler.destination_plate_ceiling, 2);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = OrchestratorConfig::load_from(dir.path().join("absent.toml")).expect("loads");
        assert_eq!(config.scheduler.poll_interval_ms, 100);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[scheduler]\ndestination_plate_ceiling = 4\n");
        std::env::set_var("LABORCH_SCHEDULER__DESTINATION_PLATE_CEILING", "6");
        let result = OrchestratorConfig::load_from(file.path());
        std::env::remove_var("LABORCH_SCHEDULER__DESTINATION_PLATE_CEILING");

        let config = result.expect("loads");
        assert_eq!(config.scheduler.destination_plate_ceiling, 6);
    }

    #[test]
    #[serial]
    fn test_invalid_log_level_rejected() {
        let file = write_config("[application]\nlog_level = \"verbose\"\n");
        let err = OrchestratorConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("verbose")));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_load_error() {
        let file = write_config("[scheduler\nsource_plate_ceiling = ");
        let err = OrchestratorConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.source_plate_ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.scheduler.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.executor.shutdown_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_recovery() {
        let recovery = RecoveryConfig {
            max_auto_retries: 2,
            retry_backoff_ms: 250,
        };
        let policy = recovery.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff_delay, Duration::from_millis(250));
    }
}
