//! Engine wiring.
//!
//! [`JobEngine`] is built once at startup from [`Settings`] and owns every
//! collaborator: repository, clock, id generator, handler registry, services
//! and the async executor. Nothing is global; shutting the engine down stops
//! the executor and nothing else needs tearing down.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::db::{establish_async_connection_pool, run_pending_migrations};
use crate::error::AppResult;
use crate::id::{IdGenerator, UuidIdGenerator};
use crate::jobs::acquisition::{AcquisitionConfig, AcquisitionEngine};
use crate::jobs::async_executor::{AsyncExecutor, LoopSettings};
use crate::jobs::handler::{JobHandler, JobTask};
use crate::jobs::registry::JobHandlerRegistry;
use crate::jobs::runner::JobExecutionRunner;
use crate::jobs::tasks;
use crate::jobs::worker_pool::WorkerPool;
use crate::repositories::{JobRepository, MemoryJobRepository, PgJobRepository};
use crate::services::Services;

pub struct JobEngineBuilder {
    settings: Settings,
    repository: Option<Arc<dyn JobRepository>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: JobHandlerRegistry,
}

impl JobEngineBuilder {
    fn new(settings: Settings) -> Self {
        let mut registry = JobHandlerRegistry::new();
        tasks::register_builtin(&mut registry);
        Self {
            settings,
            repository: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIdGenerator),
            registry,
        }
    }

    /// Use `repository` instead of an in-memory one
    pub fn with_repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn register_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register_handler(handler);
        self
    }

    pub fn register<T>(mut self) -> Self
    where
        T: JobTask + DeserializeOwned + 'static,
    {
        self.registry.register::<T>();
        self
    }

    pub fn build(self) -> AppResult<JobEngine> {
        let Self {
            settings,
            repository,
            clock,
            ids,
            registry,
        } = self;
        settings.executor.validate()?;
        settings.external_worker.validate()?;

        let repository = repository.unwrap_or_else(|| Arc::new(MemoryJobRepository::new()));
        let executor_settings = &settings.executor;
        let lock_owner = executor_settings
            .lock_owner
            .clone()
            .unwrap_or_else(|| ids.next_id());

        let retry_policy = executor_settings.retry.build_policy()?;
        let registry = Arc::new(registry);

        let runner = JobExecutionRunner::new(
            Arc::clone(&repository),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::from(retry_policy),
            executor_settings.retry.default_retries,
        )
        .with_handler_timeout(executor_settings.handler_timeout_ms.map(Duration::from_millis));

        let pool = Arc::new(WorkerPool::new(
            runner,
            lock_owner.clone(),
            executor_settings.max_pool_size,
            executor_settings.queue_capacity,
        ));
        let acquisition = Arc::new(AcquisitionEngine::new(
            Arc::clone(&repository),
            Arc::clone(&clock),
            AcquisitionConfig::from_settings(executor_settings, lock_owner.clone()),
        ));
        let executor = AsyncExecutor::new(
            LoopSettings::from(executor_settings),
            acquisition,
            pool,
            Arc::clone(&repository),
        );
        let services = Services::new(Arc::clone(&repository), Arc::clone(&clock), ids, &settings);

        info!(
            lock_owner = %lock_owner,
            handlers = ?registry.handler_types(),
            "Job engine built"
        );
        Ok(JobEngine {
            settings,
            repository,
            clock,
            registry,
            services,
            executor,
        })
    }
}

/// The assembled job engine
#[derive(Clone, Debug)]
pub struct JobEngine {
    settings: Settings,
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    registry: Arc<JobHandlerRegistry>,
    services: Services,
    executor: AsyncExecutor,
}

impl JobEngine {
    pub fn builder(settings: Settings) -> JobEngineBuilder {
        JobEngineBuilder::new(settings)
    }

    /// Builder backed by PostgreSQL, migrating first when
    /// `database.auto_migrate` is set.
    pub async fn postgres(settings: Settings) -> AppResult<JobEngineBuilder> {
        settings.database.validate()?;
        if settings.database.auto_migrate {
            let applied = run_pending_migrations(&settings.database.url).await?;
            if !applied.is_empty() {
                info!(migrations = ?applied, "Applied pending migrations");
            }
        }
        let pool = establish_async_connection_pool(&settings.database).await?;
        Ok(Self::builder(settings).with_repository(Arc::new(PgJobRepository::new(pool))))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &JobHandlerRegistry {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn executor(&self) -> &AsyncExecutor {
        &self.executor
    }

    /// Start the async executor when `executor.enabled` is set
    pub async fn start(&self) -> AppResult<()> {
        if !self.settings.executor.enabled {
            info!("Async executor disabled by configuration");
            return Ok(());
        }
        self.executor.start().await
    }

    /// Stop the executor; returns whether all running jobs finished in time
    pub async fn shutdown(&self) -> bool {
        self.executor.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::jobs::tasks::{DeadLetterCleanupTask, EXTERNAL_WORKER_COMPLETE};
    use crate::jobs::types::{JobQuery, NewJob};
    use crate::jobs::ExecutorState;
    use crate::services::AcquireRequest;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.executor.lock_owner = Some("engine-test".to_string());
        settings.executor.default_async_job_acquire_wait_time_ms = 10;
        settings.executor.default_timer_job_acquire_wait_time_ms = 10;
        settings.executor.max_acquire_wait_time_ms = 50;
        settings.executor.acquire_jitter_ms = 1;
        settings
    }

    #[test]
    fn test_builder_registers_builtin_handlers() {
        let engine = JobEngine::builder(settings()).build().unwrap();
        assert!(engine.registry().contains(EXTERNAL_WORKER_COMPLETE));
        assert!(
            engine
                .registry()
                .contains(<DeadLetterCleanupTask as JobTask>::task_type())
        );
        assert_eq!(engine.executor().lock_owner(), "engine-test");
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        let mut invalid = settings();
        invalid.executor.max_pool_size = 0;
        let result = JobEngine::builder(invalid).build();
        assert!(matches!(result, Err(AppError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_external_completion_continues_through_executor() {
        let engine = JobEngine::builder(settings()).build().unwrap();
        let services = engine.services();

        let job = services
            .jobs
            .create_external_worker_job(NewJob::new("external").with_configuration("invoices"))
            .await
            .unwrap();
        services
            .external_workers
            .acquire_and_lock(&AcquireRequest::new("invoices", "worker-a"))
            .await
            .unwrap();
        services
            .external_workers
            .complete(&job.id, "worker-a", &[])
            .await
            .unwrap();

        engine.start().await.unwrap();
        assert_eq!(engine.executor().state(), ExecutorState::Running);

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            while services.jobs.count_jobs(&JobQuery::default()).await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(finished.is_ok());
        assert!(engine.shutdown().await);
    }
}
