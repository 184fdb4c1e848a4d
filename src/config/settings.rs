//! Configuration settings structures for lockstep
//!
//! This module defines all configuration structures that can be loaded from
//! TOML files and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::jobs::retry::{ExponentialBackoff, FixedDelay, RetryPolicy};
use crate::jobs::types::JobExecutionScope;
use crate::logger::{ConsoleConfig, FileConfig, LogFormat, LoggerConfig, RotationConfig};

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "lockstep".to_string()
}

fn default_app_version() -> String {
    crate::pkg_version().to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "logs/lockstep.log".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_max_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_files() -> usize {
    5
}

// ============================================================================
// Application Configuration
// ============================================================================

/// Application basic information configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Application version
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// Diesel database connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Whether to automatically run pending migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            auto_migrate: false,
        }
    }
}

// ============================================================================
// Logger Settings
// ============================================================================

/// Console output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// Whether console output is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to use colored output
    #[serde(default = "default_true")]
    pub colored: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            colored: default_true(),
        }
    }
}

/// Size-based rotation settings for file logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Maximum file size in bytes before rotation
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Maximum number of rotated files to keep
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_files: default_max_files(),
        }
    }
}

/// File output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Whether file output is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Path to the log file
    #[serde(default = "default_log_path")]
    pub path: String,

    /// Whether to append to existing file
    #[serde(default = "default_true")]
    pub append: bool,

    /// Log format: "full", "compact", or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Rotation settings
    #[serde(default)]
    pub rotation: RotationSettings,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            append: default_true(),
            format: default_log_format(),
            rotation: RotationSettings::default(),
        }
    }
}

/// Logger configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level or filter directive, e.g. "info" or "lockstep=debug,info"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console output settings
    #[serde(default)]
    pub console: ConsoleSettings,

    /// File output settings
    #[serde(default)]
    pub file: FileSettings,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: ConsoleSettings::default(),
            file: FileSettings::default(),
        }
    }
}

impl LoggerSettings {
    /// Convert LoggerSettings to the runtime LoggerConfig
    pub fn into_logger_config(self) -> Result<LoggerConfig, ConfigError> {
        let console = ConsoleConfig::new(self.console.enabled, self.console.colored);
        let format = self
            .file
            .format
            .parse::<LogFormat>()
            .map_err(|e| ConfigError::validation("logger.file.format", &e.to_string()))?;
        let rotation = RotationConfig::new(self.file.rotation.max_size, self.file.rotation.max_files)
            .map_err(|e| ConfigError::validation("logger.file.rotation", &e.to_string()))?;
        let file = FileConfig::new(
            self.file.enabled,
            PathBuf::from(self.file.path),
            self.file.append,
            format,
            rotation,
        )
        .map_err(|e| ConfigError::validation("logger.file", &e.to_string()))?;

        LoggerConfig::new(console, file, self.level)
            .map_err(|e| ConfigError::validation("logger", &e.to_string()))
    }
}

// ============================================================================
// Executor Configuration
// ============================================================================

fn default_execution_scope() -> String {
    "all".to_string()
}

fn default_max_pool_size() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    100
}

fn default_async_job_lock_time_ms() -> u64 {
    5 * 60 * 1000
}

fn default_timer_lock_time_ms() -> u64 {
    60 * 60 * 1000
}

fn default_max_async_jobs_due_per_acquisition() -> usize {
    1
}

fn default_max_timer_jobs_per_acquisition() -> usize {
    1
}

fn default_async_acquire_wait_ms() -> u64 {
    10_000
}

fn default_timer_acquire_wait_ms() -> u64 {
    10_000
}

fn default_max_acquire_wait_ms() -> u64 {
    60_000
}

fn default_acquire_jitter_ms() -> u64 {
    100
}

fn default_reset_expired_interval_ms() -> u64 {
    60_000
}

fn default_reset_expired_page_size() -> usize {
    3
}

fn default_reset_expired_max_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_retry_strategy() -> String {
    "fixed".to_string()
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

fn default_job_retries() -> i32 {
    3
}

/// Retry rescheduling policy for failed jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// "fixed" or "exponential"
    #[serde(default = "default_retry_strategy")]
    pub strategy: String,

    /// Base delay before a failed job becomes due again
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    /// Growth factor per consumed retry (exponential only)
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,

    /// Upper bound on the computed delay (exponential only)
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retries given to jobs created without an explicit value
    #[serde(default = "default_job_retries")]
    pub default_retries: i32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: default_retry_strategy(),
            delay_ms: default_retry_delay_ms(),
            multiplier: default_retry_multiplier(),
            max_delay_ms: default_retry_max_delay_ms(),
            default_retries: default_job_retries(),
        }
    }
}

impl RetrySettings {
    /// Build the configured retry policy
    pub fn build_policy(&self) -> Result<Box<dyn RetryPolicy>, ConfigError> {
        let delay = Duration::from_millis(self.delay_ms);
        match self.strategy.to_lowercase().as_str() {
            "fixed" => Ok(Box::new(FixedDelay::new(delay))),
            "exponential" => Ok(Box::new(ExponentialBackoff::new(
                delay,
                self.multiplier,
                Duration::from_millis(self.max_delay_ms),
            ))),
            _ => Err(ConfigError::UnknownRetryStrategy(self.strategy.clone())),
        }
    }
}

/// Async executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Whether `serve` starts the executor loops
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lock owner identity; a random one is generated when unset
    #[serde(default)]
    pub lock_owner: Option<String>,

    /// Which jobs this executor may acquire: "all", "unscoped", or a scope type
    #[serde(default = "default_execution_scope")]
    pub execution_scope: String,

    /// Jobs executing concurrently
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Claimed jobs allowed to wait for a free worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_async_job_lock_time_ms")]
    pub async_job_lock_time_ms: u64,

    #[serde(default = "default_timer_lock_time_ms")]
    pub timer_lock_time_ms: u64,

    #[serde(default = "default_max_async_jobs_due_per_acquisition")]
    pub max_async_jobs_due_per_acquisition: usize,

    #[serde(default = "default_max_timer_jobs_per_acquisition")]
    pub max_timer_jobs_per_acquisition: usize,

    #[serde(default = "default_async_acquire_wait_ms")]
    pub default_async_job_acquire_wait_time_ms: u64,

    #[serde(default = "default_timer_acquire_wait_ms")]
    pub default_timer_job_acquire_wait_time_ms: u64,

    /// Ceiling for the idle backoff of both acquire loops
    #[serde(default = "default_max_acquire_wait_ms")]
    pub max_acquire_wait_time_ms: u64,

    /// Random extra delay added to each idle sleep
    #[serde(default = "default_acquire_jitter_ms")]
    pub acquire_jitter_ms: u64,

    #[serde(default = "default_reset_expired_interval_ms")]
    pub reset_expired_jobs_interval_ms: u64,

    #[serde(default = "default_reset_expired_page_size")]
    pub reset_expired_jobs_page_size: usize,

    /// Grace period past lock expiry before the sweep reclaims a job
    #[serde(default = "default_reset_expired_max_timeout_ms")]
    pub reset_expired_jobs_max_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Abort a handler that runs longer than this
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,

    /// Also acquire HISTORY jobs in the async acquire loop
    #[serde(default = "default_true")]
    pub async_history_enabled: bool,

    #[serde(default = "default_true")]
    pub timer_acquire_enabled: bool,

    #[serde(default = "default_true")]
    pub async_acquire_enabled: bool,

    #[serde(default = "default_true")]
    pub reset_expired_enabled: bool,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_owner: None,
            execution_scope: default_execution_scope(),
            max_pool_size: default_max_pool_size(),
            queue_capacity: default_queue_capacity(),
            async_job_lock_time_ms: default_async_job_lock_time_ms(),
            timer_lock_time_ms: default_timer_lock_time_ms(),
            max_async_jobs_due_per_acquisition: default_max_async_jobs_due_per_acquisition(),
            max_timer_jobs_per_acquisition: default_max_timer_jobs_per_acquisition(),
            default_async_job_acquire_wait_time_ms: default_async_acquire_wait_ms(),
            default_timer_job_acquire_wait_time_ms: default_timer_acquire_wait_ms(),
            max_acquire_wait_time_ms: default_max_acquire_wait_ms(),
            acquire_jitter_ms: default_acquire_jitter_ms(),
            reset_expired_jobs_interval_ms: default_reset_expired_interval_ms(),
            reset_expired_jobs_page_size: default_reset_expired_page_size(),
            reset_expired_jobs_max_timeout_ms: default_reset_expired_max_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            handler_timeout_ms: None,
            async_history_enabled: true,
            timer_acquire_enabled: true,
            async_acquire_enabled: true,
            reset_expired_enabled: true,
            retry: RetrySettings::default(),
        }
    }
}

impl ExecutorSettings {
    /// Parse `execution_scope` into the filter used by acquisition queries
    pub fn job_execution_scope(&self) -> JobExecutionScope {
        JobExecutionScope::from_setting(&self.execution_scope)
    }
}

// ============================================================================
// External Worker Configuration
// ============================================================================

fn default_external_lock_duration_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_tasks_per_acquire() -> usize {
    100
}

/// Defaults for the external worker lease protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalWorkerSettings {
    /// Lease length used when a worker does not ask for one
    #[serde(default = "default_external_lock_duration_ms")]
    pub default_lock_duration_ms: u64,

    /// Upper bound on `number_of_tasks` per acquire request
    #[serde(default = "default_max_tasks_per_acquire")]
    pub max_tasks_per_acquire: usize,
}

impl Default for ExternalWorkerSettings {
    fn default() -> Self {
        Self {
            default_lock_duration_ms: default_external_lock_duration_ms(),
            max_tasks_per_acquire: default_max_tasks_per_acquire(),
        }
    }
}

// ============================================================================
// Main Settings Structure
// ============================================================================

/// Complete application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application information
    #[serde(default)]
    pub application: ApplicationConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logger configuration
    #[serde(default)]
    pub logger: LoggerSettings,

    /// Async executor configuration
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// External worker protocol defaults
    #[serde(default)]
    pub external_worker: ExternalWorkerSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_retry_settings() -> impl Strategy<Value = RetrySettings> {
        (
            prop_oneof![Just("fixed".to_string()), Just("exponential".to_string())],
            1u64..=600_000u64,
            1.0f64..=4.0f64,
            600_000u64..=86_400_000u64,
            0i32..=10i32,
        )
            .prop_map(
                |(strategy, delay_ms, multiplier, max_delay_ms, default_retries)| RetrySettings {
                    strategy,
                    delay_ms,
                    multiplier,
                    max_delay_ms,
                    default_retries,
                },
            )
    }

    fn arb_executor_settings() -> impl Strategy<Value = ExecutorSettings> {
        (
            prop_oneof![
                Just("all".to_string()),
                Just("unscoped".to_string()),
                Just("bpmn".to_string()),
                Just("cmmn".to_string()),
            ],
            1usize..=64usize,
            0usize..=1000usize,
            1_000u64..=3_600_000u64,
            1usize..=50usize,
            arb_retry_settings(),
        )
            .prop_map(
                |(execution_scope, max_pool_size, queue_capacity, lock_ms, batch, retry)| {
                    ExecutorSettings {
                        execution_scope,
                        max_pool_size,
                        queue_capacity,
                        async_job_lock_time_ms: lock_ms,
                        max_async_jobs_due_per_acquisition: batch,
                        retry,
                        ..ExecutorSettings::default()
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn prop_executor_settings_toml_roundtrip(settings in arb_executor_settings()) {
            let encoded = toml_string(&settings);
            let decoded: ExecutorSettings = config::Config::builder()
                .add_source(config::File::from_str(&encoded, config::FileFormat::Toml))
                .build()
                .unwrap()
                .try_deserialize()
                .unwrap();
            prop_assert_eq!(decoded.execution_scope, settings.execution_scope);
            prop_assert_eq!(decoded.max_pool_size, settings.max_pool_size);
            prop_assert_eq!(decoded.retry.strategy, settings.retry.strategy);
        }

        #[test]
        fn prop_retry_settings_always_build(retry in arb_retry_settings()) {
            prop_assert!(retry.build_policy().is_ok());
        }
    }

    fn toml_string(settings: &ExecutorSettings) -> String {
        let mut out = String::new();
        out.push_str(&format!("execution_scope = \"{}\"\n", settings.execution_scope));
        out.push_str(&format!("max_pool_size = {}\n", settings.max_pool_size));
        out.push_str(&format!("queue_capacity = {}\n", settings.queue_capacity));
        out.push_str(&format!(
            "async_job_lock_time_ms = {}\n",
            settings.async_job_lock_time_ms
        ));
        out.push_str("[retry]\n");
        out.push_str(&format!("strategy = \"{}\"\n", settings.retry.strategy));
        out.push_str(&format!("delay_ms = {}\n", settings.retry.delay_ms));
        out
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.application.name, "lockstep");
        assert!(settings.executor.enabled);
        assert_eq!(settings.executor.retry.default_retries, 3);
        assert_eq!(settings.external_worker.default_lock_duration_ms, 600_000);
    }

    #[test]
    fn test_invalid_retry_strategy() {
        let retry = RetrySettings {
            strategy: "linear".to_string(),
            ..RetrySettings::default()
        };
        assert!(retry.build_policy().is_err());
    }

    #[test]
    fn test_job_execution_scope_parsing() {
        let mut settings = ExecutorSettings::default();
        assert_eq!(settings.job_execution_scope(), JobExecutionScope::All);

        settings.execution_scope = "unscoped".to_string();
        assert_eq!(settings.job_execution_scope(), JobExecutionScope::Unscoped);

        settings.execution_scope = "cmmn".to_string();
        assert_eq!(
            settings.job_execution_scope(),
            JobExecutionScope::ScopeType("cmmn".to_string())
        );
    }

    #[test]
    fn test_logger_settings_conversion() {
        let settings = LoggerSettings::default();
        let config = settings.into_logger_config().expect("default logger settings convert");
        assert_eq!(config.level, "info");
        assert!(config.console.enabled);
        assert!(!config.file.enabled);
    }
}
