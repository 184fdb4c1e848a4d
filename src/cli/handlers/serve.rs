//! Serve command handler
//!
//! Runs the async executor against PostgreSQL until Ctrl-C, or only checks
//! the configuration with `--dry-run`.

use tracing::{info, warn};

use crate::config::settings::Settings;
use crate::engine::JobEngine;
use crate::error::{AppError, AppResult};

/// Handler for the serve command
pub struct ServeCommandHandler {
    config: Settings,
}

impl ServeCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    /// # Errors
    /// - Configuration validation errors
    /// - Database connection or migration errors (if not dry-run)
    pub async fn execute(&self, dry_run: bool) -> AppResult<()> {
        if dry_run {
            self.validate_only()
        } else {
            self.run().await
        }
    }

    /// Validate configuration without touching the database
    pub fn validate_only(&self) -> AppResult<()> {
        self.config.validate()?;
        self.config.executor.retry.build_policy()?;

        let executor = &self.config.executor;
        println!("✓ Configuration is valid");
        println!(
            "✓ Lock owner: {}",
            executor.lock_owner.as_deref().unwrap_or("<generated at startup>")
        );
        println!("✓ Execution scope: {}", executor.job_execution_scope());
        println!(
            "✓ Worker pool: {} workers, {} queued",
            executor.max_pool_size, executor.queue_capacity
        );
        println!(
            "✓ Retry policy: {} ({} retries by default)",
            executor.retry.strategy, executor.retry.default_retries
        );
        if !executor.enabled {
            println!("! executor.enabled is false - serve would not acquire jobs");
        }

        println!("Dry run completed successfully - configuration is ready for deployment");
        Ok(())
    }

    async fn run(&self) -> AppResult<()> {
        let engine = JobEngine::postgres(self.config.clone()).await?.build()?;
        engine.start().await?;
        info!(
            lock_owner = %engine.executor().lock_owner(),
            "lockstep is running, press Ctrl-C to stop"
        );

        tokio::signal::ctrl_c().await.map_err(|e| AppError::Internal {
            source: anyhow::Error::from(e),
        })?;
        info!("Shutdown signal received");

        if !engine.shutdown().await {
            warn!("Shutdown timed out; unfinished jobs stay locked until their lock expires");
        }
        Ok(())
    }

    pub fn config(&self) -> &Settings {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Settings {
        let mut config = Settings::default();
        config.database.url = "postgres://localhost/test".to_string();
        config
    }

    #[test]
    fn test_serve_handler_new() {
        let config = create_valid_config();
        let handler = ServeCommandHandler::new(config.clone());
        assert_eq!(handler.config(), &config);
    }

    #[tokio::test]
    async fn test_serve_handler_dry_run() {
        let handler = ServeCommandHandler::new(create_valid_config());
        assert!(handler.execute(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_serve_handler_dry_run_invalid_config() {
        let mut config = create_valid_config();
        config.executor.max_pool_size = 0;
        let handler = ServeCommandHandler::new(config);

        assert!(handler.execute(true).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_handler_dry_run_rejects_unknown_retry_strategy() {
        let mut config = create_valid_config();
        config.executor.retry.strategy = "linear".to_string();
        let handler = ServeCommandHandler::new(config);

        assert!(handler.execute(true).await.is_err());
    }
}
