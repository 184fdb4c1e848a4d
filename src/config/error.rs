//! Errors raised while loading or checking lockstep settings

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Configuration could not be read: {0}")]
    Malformed(String),

    #[error("Invalid setting {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Unknown retry strategy '{0}'; expected fixed or exponential")]
    UnknownRetryStrategy(String),

    /// A pool size, batch size or executor interval was zero
    #[error("{field} must be greater than 0")]
    ZeroExecutorLimit { field: &'static str },

    #[error(
        "executor.max_acquire_wait_time_ms ({ceiling}) cannot be below the default wait time ({floor})"
    )]
    AcquireWaitCeiling { ceiling: u64, floor: u64 },

    #[error("Unknown environment '{0}'; expected development, test, staging or production")]
    UnknownEnvironment(String),

    #[error("LOCKSTEP_CONFIG_DIR and LOCKSTEP_CONFIG_FILE cannot both be set")]
    ConflictingSources,

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Dotted settings key the error points at, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::ValidationError { field, .. } => Some(field),
            ConfigError::UnknownRetryStrategy(_) => Some("executor.retry.strategy"),
            ConfigError::ZeroExecutorLimit { field } => Some(field),
            ConfigError::AcquireWaitCeiling { .. } => Some("executor.max_acquire_wait_time_ms"),
            _ => None,
        }
    }
}
