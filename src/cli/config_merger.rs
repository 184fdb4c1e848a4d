//! Configuration merger for CLI arguments and config files
//!
//! CLI arguments override file and environment configuration; the merged
//! settings are validated once more before any command runs.

use std::path::Path;

use super::parser::{Cli, Commands};
use crate::config::error::ConfigError;
use crate::config::{ConfigLoader, settings::Settings};

/// Applies CLI overrides on top of loaded [`Settings`]
pub struct ConfigurationMerger {
    base_config: Settings,
}

impl ConfigurationMerger {
    pub fn new(base_config: Settings) -> Self {
        Self { base_config }
    }

    /// Load the base configuration the way the CLI was asked to: a single
    /// file with `--config`, otherwise the layered `config/` directory.
    ///
    /// # Errors
    /// Returns ConfigError if configuration loading or validation fails
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let loader = match cli.config.as_deref() {
            Some(path) => {
                Self::validate_config_file_access(path)?;
                ConfigLoader::from_file(path)
            }
            None => ConfigLoader::new()?,
        };
        let loader = match cli.env {
            Some(env) => loader.with_environment(env.into()),
            None => loader,
        };

        Ok(Self::new(loader.load()?))
    }

    fn validate_config_file_access(path: &Path) -> Result<(), ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::validation(
                "config_file",
                format!("Configuration file does not exist or is not a file: '{}'", path.display()),
            ));
        }

        std::fs::File::open(path).map(|_| ()).map_err(|e| {
            ConfigError::validation(
                "config_file",
                format!("Cannot read configuration file '{}': {}", path.display(), e),
            )
        })
    }

    /// Merge CLI arguments with the base configuration
    ///
    /// Command-specific flags beat global flags, which beat the loaded values.
    pub fn merge_cli_args(&self, cli: &Cli) -> Result<Settings, ConfigError> {
        let mut config = self.base_config.clone();

        Self::apply_global_overrides(&mut config, cli);

        if let Some(ref command) = cli.command {
            Self::apply_command_overrides(&mut config, command);
        }

        config.validate()?;

        Ok(config)
    }

    fn apply_global_overrides(config: &mut Settings, cli: &Cli) {
        if cli.verbose {
            config.logger.level = "debug".to_string();
        } else if cli.quiet {
            config.logger.level = "error".to_string();
        }
    }

    fn apply_command_overrides(config: &mut Settings, command: &Commands) {
        match command {
            Commands::Serve {
                lock_owner,
                log_level,
                dry_run: _,
            } => {
                if let Some(owner) = lock_owner {
                    config.executor.lock_owner = Some(owner.clone());
                }
                if let Some(level) = log_level {
                    config.logger.level = (*level).into();
                }
            }
            Commands::Migrate { .. } | Commands::Jobs { .. } => {}
        }
    }

    pub fn config(&self) -> &Settings {
        &self.base_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn create_valid_base_config() -> Settings {
        let mut config = Settings::default();
        config.database.url = "postgres://localhost/test".to_string();
        config
    }

    fn merge(args: &[&str]) -> Result<Settings, ConfigError> {
        let merger = ConfigurationMerger::new(create_valid_base_config());
        let cli = Cli::try_parse_from(args).unwrap();
        merger.merge_cli_args(&cli)
    }

    #[test]
    fn test_configuration_merger_new() {
        let base_config = create_valid_base_config();
        let merger = ConfigurationMerger::new(base_config.clone());
        assert_eq!(merger.config(), &base_config);
    }

    #[test]
    fn test_merge_without_overrides_keeps_base() {
        let merged = merge(&["lockstep", "jobs", "count"]).unwrap();
        assert_eq!(merged, create_valid_base_config());
    }

    #[test]
    fn test_merge_verbose_flag() {
        assert_eq!(merge(&["lockstep", "--verbose"]).unwrap().logger.level, "debug");
    }

    #[test]
    fn test_merge_quiet_flag() {
        assert_eq!(merge(&["lockstep", "--quiet"]).unwrap().logger.level, "error");
    }

    #[test]
    fn test_merge_serve_lock_owner() {
        let merged = merge(&["lockstep", "serve", "--lock-owner", "node-9"]).unwrap();
        assert_eq!(merged.executor.lock_owner.as_deref(), Some("node-9"));
    }

    #[test]
    fn test_command_log_level_overrides_global() {
        let merged = merge(&["lockstep", "--verbose", "serve", "--log-level", "warn"]).unwrap();
        assert_eq!(merged.logger.level, "warn");
    }

    #[test]
    fn test_merge_rejects_invalid_base() {
        let merger = ConfigurationMerger::new(Settings::default());
        let cli = Cli::try_parse_from(["lockstep", "serve"]).unwrap();
        let err = merger.merge_cli_args(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { ref field, .. } if field == "database.url"));
    }
}
