//! CLI argument validation functions
//!
//! Custom value parsers for arguments clap cannot check on its own.

use std::fs;
use std::path::PathBuf;

use crate::jobs::JobState;

const MAX_LIST_LIMIT: i64 = 10_000;

/// Validate that a file path is accessible (exists and is readable)
pub fn validate_config_file_path(path_str: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(format!("Configuration file does not exist: '{}'", path_str));
    }

    if !path.is_file() {
        return Err(format!("Configuration path is not a file: '{}'", path_str));
    }

    match fs::File::open(&path) {
        Ok(_) => Ok(path),
        Err(e) => Err(format!("Cannot read configuration file '{}': {}", path_str, e)),
    }
}

/// Validate rollback steps is a positive number
pub fn validate_rollback_steps(steps_str: &str) -> Result<u32, String> {
    let steps: u32 = steps_str.parse().map_err(|_| {
        format!("Rollback steps must be a valid positive number, got: '{}'", steps_str)
    })?;

    if steps == 0 {
        return Err("Rollback steps must be greater than 0".to_string());
    }

    if steps > 100 {
        return Err("Rollback steps cannot exceed 100 for safety reasons".to_string());
    }

    Ok(steps)
}

/// Lock owners are stored in a 255 character column and compared verbatim
pub fn validate_lock_owner(owner: &str) -> Result<String, String> {
    let trimmed = owner.trim();
    if trimmed.is_empty() {
        return Err("Lock owner cannot be empty".to_string());
    }
    if trimmed.len() > 255 {
        return Err("Lock owner is too long (maximum 255 characters)".to_string());
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err("Lock owner cannot contain whitespace".to_string());
    }
    Ok(trimmed.to_string())
}

/// Accepts state names case-insensitively, with `-` or `_`
pub fn validate_job_state(state: &str) -> Result<JobState, String> {
    state.parse::<JobState>().map_err(|e| e.to_string())
}

pub fn validate_retries(retries_str: &str) -> Result<i32, String> {
    let retries: i32 = retries_str
        .parse()
        .map_err(|_| format!("Retries must be a number, got: '{}'", retries_str))?;
    if retries < 1 {
        return Err("Retries must be at least 1".to_string());
    }
    Ok(retries)
}

pub fn validate_limit(limit_str: &str) -> Result<i64, String> {
    let limit: i64 = limit_str
        .parse()
        .map_err(|_| format!("Limit must be a number, got: '{}'", limit_str))?;
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(format!("Limit must be between 1 and {}", MAX_LIST_LIMIT));
    }
    Ok(limit)
}
