//! Configuration validation logic
//!
//! Each section validates its own ranges and formats; `Settings::validate`
//! reports the first failure.

use crate::config::error::ConfigError;
use crate::config::settings::{
    DatabaseConfig, ExecutorSettings, ExternalWorkerSettings, FileSettings, LoggerSettings,
    RetrySettings, Settings,
};

/// Valid log levels
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log formats
const VALID_LOG_FORMATS: &[&str] = &["full", "compact", "json"];

impl DatabaseConfig {
    /// Validate database configuration
    ///
    /// # Validation Rules
    /// - URL must not be empty and must use a postgres scheme
    /// - Max and min connections must be greater than 0
    /// - Min connections must not exceed max connections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::validation(
                "database.url",
                "Database URL is required. Please specify a valid database connection string.",
            ));
        }

        if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
            return Err(ConfigError::validation(
                "database.url",
                "Invalid database URL format. Expected format: postgres://[user:password@]host[:port]/database",
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "database.max_connections",
                "Max connections must be greater than 0.",
            ));
        }

        if self.min_connections == 0 {
            return Err(ConfigError::validation(
                "database.min_connections",
                "Min connections must be greater than 0.",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::validation(
                "database.min_connections",
                format!(
                    "Min connections ({}) cannot exceed max connections ({}).",
                    self.min_connections, self.max_connections
                ),
            ));
        }

        Ok(())
    }
}

impl FileSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.trim().is_empty() {
            return Err(ConfigError::validation(
                "logger.file.path",
                "File path is required when file logging is enabled.",
            ));
        }

        if !VALID_LOG_FORMATS.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::validation(
                "logger.file.format",
                format!(
                    "Invalid log format '{}'. Valid formats are: {}",
                    self.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            ));
        }

        if self.enabled && self.rotation.max_size == 0 {
            return Err(ConfigError::validation(
                "logger.file.rotation.max_size",
                "Rotation size must be greater than 0 bytes.",
            ));
        }

        Ok(())
    }
}

impl LoggerSettings {
    /// Validate logger settings
    ///
    /// The level is either a plain level name or an `EnvFilter` directive
    /// list such as `lockstep=debug,info`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.level.to_lowercase();
        let is_directive = level.contains('=') || level.contains(',');
        if !is_directive && !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::validation(
                "logger.level",
                format!(
                    "Invalid log level '{}'. Valid levels are: {}",
                    self.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        self.file.validate()
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.build_policy()?;

        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::validation(
                "executor.retry.multiplier",
                "Retry multiplier must be at least 1.0.",
            ));
        }

        if self.default_retries < 0 {
            return Err(ConfigError::validation(
                "executor.retry.default_retries",
                "Default retries cannot be negative.",
            ));
        }

        Ok(())
    }
}

impl ExecutorSettings {
    /// Validate executor configuration
    ///
    /// # Validation Rules
    /// - Pool size, batch sizes and the reset page size must be greater than 0
    /// - Lock times and acquire wait times must be greater than 0
    /// - The idle backoff ceiling must not be below either default wait time
    /// - A configured lock owner must not be blank
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_counts = [
            ("executor.max_pool_size", self.max_pool_size),
            (
                "executor.max_async_jobs_due_per_acquisition",
                self.max_async_jobs_due_per_acquisition,
            ),
            (
                "executor.max_timer_jobs_per_acquisition",
                self.max_timer_jobs_per_acquisition,
            ),
            (
                "executor.reset_expired_jobs_page_size",
                self.reset_expired_jobs_page_size,
            ),
        ];
        for (field, value) in positive_counts {
            if value == 0 {
                return Err(ConfigError::ZeroExecutorLimit { field });
            }
        }

        let positive_durations = [
            ("executor.async_job_lock_time_ms", self.async_job_lock_time_ms),
            ("executor.timer_lock_time_ms", self.timer_lock_time_ms),
            (
                "executor.default_async_job_acquire_wait_time_ms",
                self.default_async_job_acquire_wait_time_ms,
            ),
            (
                "executor.default_timer_job_acquire_wait_time_ms",
                self.default_timer_job_acquire_wait_time_ms,
            ),
            (
                "executor.reset_expired_jobs_interval_ms",
                self.reset_expired_jobs_interval_ms,
            ),
        ];
        for (field, value) in positive_durations {
            if value == 0 {
                return Err(ConfigError::ZeroExecutorLimit { field });
            }
        }

        let floor = self
            .default_async_job_acquire_wait_time_ms
            .max(self.default_timer_job_acquire_wait_time_ms);
        if self.max_acquire_wait_time_ms < floor {
            return Err(ConfigError::AcquireWaitCeiling {
                ceiling: self.max_acquire_wait_time_ms,
                floor,
            });
        }

        if let Some(owner) = &self.lock_owner {
            if owner.trim().is_empty() {
                return Err(ConfigError::validation(
                    "executor.lock_owner",
                    "Lock owner cannot be blank. Remove the key to generate one.",
                ));
            }
        }

        if self.execution_scope.trim().is_empty() {
            return Err(ConfigError::validation(
                "executor.execution_scope",
                "Execution scope cannot be blank. Use 'all', 'unscoped' or a scope type.",
            ));
        }

        self.retry.validate()
    }
}

impl ExternalWorkerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_lock_duration_ms == 0 {
            return Err(ConfigError::validation(
                "external_worker.default_lock_duration_ms",
                "Lock duration must be greater than 0 milliseconds.",
            ));
        }
        if self.max_tasks_per_acquire == 0 {
            return Err(ConfigError::validation(
                "external_worker.max_tasks_per_acquire",
                "Max tasks per acquire must be greater than 0.",
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Validate all configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.logger.validate()?;
        self.executor.validate()?;
        self.external_worker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        err.field()
            .unwrap_or_else(|| panic!("Expected a field error, got {:?}", err))
            .to_string()
    }

    #[test]
    fn test_database_config_valid() {
        let config = DatabaseConfig {
            url: "postgres://localhost/test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_config_rejects_non_postgres_url() {
        let config = DatabaseConfig {
            url: "mysql://localhost/test".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(config.validate().unwrap_err()), "database.url");
    }

    #[test]
    fn test_database_config_min_exceeds_max() {
        let config = DatabaseConfig {
            url: "postgres://localhost/test".to_string(),
            max_connections: 2,
            min_connections: 5,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "database.min_connections"
        );
    }

    #[test]
    fn test_logger_settings_accepts_directives() {
        let settings = LoggerSettings {
            level: "lockstep=debug,diesel=warn".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = LoggerSettings {
            level: "verbose".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(settings.validate().unwrap_err()), "logger.level");
    }

    #[test]
    fn test_executor_defaults_are_valid() {
        assert!(ExecutorSettings::default().validate().is_ok());
        assert!(ExternalWorkerSettings::default().validate().is_ok());
    }

    #[test]
    fn test_executor_rejects_zero_pool() {
        let settings = ExecutorSettings {
            max_pool_size: 0,
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "executor.max_pool_size"
        );
    }

    #[test]
    fn test_executor_rejects_backoff_ceiling_below_default_wait() {
        let settings = ExecutorSettings {
            default_async_job_acquire_wait_time_ms: 10_000,
            max_acquire_wait_time_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "executor.max_acquire_wait_time_ms"
        );
    }

    #[test]
    fn test_executor_rejects_blank_lock_owner() {
        let settings = ExecutorSettings {
            lock_owner: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "executor.lock_owner"
        );
    }

    #[test]
    fn test_retry_rejects_unknown_strategy() {
        let mut settings = ExecutorSettings::default();
        settings.retry.strategy = "linear".to_string();
        assert!(matches!(
            settings.validate().unwrap_err(),
            ConfigError::UnknownRetryStrategy(ref name) if name == "linear"
        ));
    }

    #[test]
    fn test_retry_rejects_shrinking_multiplier() {
        let mut settings = ExecutorSettings::default();
        settings.retry.multiplier = 0.5;
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "executor.retry.multiplier"
        );
    }

    #[test]
    fn test_settings_validate_requires_database_url() {
        let settings = Settings::default();
        assert_eq!(field_of(settings.validate().unwrap_err()), "database.url");
    }
}
