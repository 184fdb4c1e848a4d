//! Command executor for dispatching CLI commands
//!
//! Entry point for running a parsed command once configuration is loaded.

use tracing::warn;

use super::handlers::{JobsCommandHandler, MigrateCommandHandler, ServeCommandHandler};
use super::parser::{Cli, Commands};
use crate::config::settings::Settings;
use crate::engine::JobEngine;
use crate::error::AppResult;

/// Rollbacks larger than this get a warning before they run
const LARGE_ROLLBACK: u32 = 50;

/// Execute a CLI command with merged and validated settings
///
/// `serve` is the default when no subcommand is given.
///
/// # Errors
/// Returns errors from command handlers
pub async fn execute_command(cli: &Cli, settings: Settings) -> AppResult<()> {
    match &cli.command {
        Some(Commands::Serve { dry_run, .. }) => {
            ServeCommandHandler::new(settings).execute(*dry_run).await
        }
        None => ServeCommandHandler::new(settings).execute(false).await,
        Some(Commands::Migrate { dry_run, rollback }) => {
            if let Some(steps) = rollback
                && *steps > LARGE_ROLLBACK
            {
                warn!(
                    steps,
                    "Rolling back this many migrations is a large operation; consider smaller steps"
                );
            }
            MigrateCommandHandler::new(settings)
                .execute(*dry_run, *rollback)
                .await
        }
        Some(Commands::Jobs { command }) => {
            let engine = JobEngine::postgres(settings).await?.build()?;
            JobsCommandHandler::new(engine.services().clone())
                .execute(command)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn create_valid_config() -> Settings {
        let mut config = Settings::default();
        config.database.url = "postgres://localhost/test".to_string();
        config
    }

    #[tokio::test]
    async fn test_execute_serve_dry_run() {
        let cli = Cli::try_parse_from(["lockstep", "serve", "--dry-run"]).unwrap();

        let result = execute_command(&cli, create_valid_config()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_execute_migrate_rejects_invalid_database_url() {
        let cli = Cli::try_parse_from(["lockstep", "migrate", "--dry-run"]).unwrap();
        let mut config = create_valid_config();
        config.database.url = "mysql://localhost/test".to_string();

        let result = execute_command(&cli, config).await;
        assert!(result.is_err());
    }
}
