//! Lease protocol for jobs executed outside the engine.
//!
//! Workers acquire jobs by topic for a limited time and must then complete,
//! fail, extend or give back each job under the same worker id. A call from
//! any other worker is rejected with `Forbidden` and changes nothing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::clock::{self, Clock};
use crate::config::ExternalWorkerSettings;
use crate::error::{AppError, AppResult};
use crate::jobs::tasks::EXTERNAL_WORKER_COMPLETE;
use crate::jobs::types::{ExternalJobAcquisition, ExternalJobFailure, Job, Variable};
use crate::repositories::JobRepository;

/// Parameters of one acquire call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub topic: String,
    pub worker_id: String,
    pub number_of_tasks: usize,
    /// Falls back to the configured default lease
    pub lock_duration: Option<Duration>,
    pub scope_type: Option<String>,
    pub tenant_id: Option<String>,
}

impl AcquireRequest {
    pub fn new(topic: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            worker_id: worker_id.into(),
            number_of_tasks: 1,
            lock_duration: None,
            scope_type: None,
            tenant_id: None,
        }
    }

    pub fn with_number_of_tasks(mut self, number_of_tasks: usize) -> Self {
        self.number_of_tasks = number_of_tasks;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = Some(lock_duration);
        self
    }

    pub fn with_scope_type(mut self, scope_type: impl Into<String>) -> Self {
        self.scope_type = Some(scope_type.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// An acquired job with a read-only snapshot of its scope variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredJob {
    pub job: Job,
    pub variables: Vec<Variable>,
}

#[derive(Clone, Debug)]
pub struct ExternalWorkerService {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    settings: ExternalWorkerSettings,
    continuation_handler_type: String,
}

fn require(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(field, format!("{} cannot be empty", field)));
    }
    Ok(())
}

impl ExternalWorkerService {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        settings: ExternalWorkerSettings,
    ) -> Self {
        Self {
            repository,
            clock,
            settings,
            continuation_handler_type: EXTERNAL_WORKER_COMPLETE.to_string(),
        }
    }

    /// Handler type completed jobs continue with
    pub fn with_continuation_handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.continuation_handler_type = handler_type.into();
        self
    }

    /// Lock up to `number_of_tasks` jobs of `topic` for `worker_id`.
    ///
    /// # Errors
    /// `Validation` for a blank topic or worker id, a task count of zero or
    /// above the configured maximum, or a zero lock duration
    #[instrument(skip(self), fields(topic = %request.topic, worker_id = %request.worker_id))]
    pub async fn acquire_and_lock(&self, request: &AcquireRequest) -> AppResult<Vec<AcquiredJob>> {
        require("topic", &request.topic)?;
        require("worker_id", &request.worker_id)?;
        if request.number_of_tasks == 0 || request.number_of_tasks > self.settings.max_tasks_per_acquire {
            return Err(AppError::validation(
                "number_of_tasks",
                format!(
                    "Must be between 1 and {}",
                    self.settings.max_tasks_per_acquire
                ),
            ));
        }
        let lock_duration = request
            .lock_duration
            .unwrap_or(Duration::from_millis(self.settings.default_lock_duration_ms));
        if lock_duration.is_zero() {
            return Err(AppError::validation("lock_duration", "Must be positive"));
        }

        let now = self.clock.now();
        let acquisition = ExternalJobAcquisition {
            topic: request.topic.clone(),
            worker_id: request.worker_id.clone(),
            number_of_tasks: request.number_of_tasks,
            lock_expiration_time: clock::plus(now, lock_duration),
            scope_type: request.scope_type.clone(),
            tenant_id: request.tenant_id.clone(),
        };
        let jobs = self.repository.acquire_external_jobs(&acquisition, now).await?;

        let mut acquired = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (scope_id, _) = job.variable_scope();
            let variables = self.repository.scope_variables(&scope_id).await?;
            acquired.push(AcquiredJob { job, variables });
        }
        if !acquired.is_empty() {
            info!(count = acquired.len(), "External worker acquired jobs");
        }
        Ok(acquired)
    }

    /// Complete a held job, writing `variables` to its scope and handing it
    /// to the continuation handler.
    #[instrument(skip(self, variables))]
    pub async fn complete(&self, job_id: &str, worker_id: &str, variables: &[Variable]) -> AppResult<Job> {
        require("worker_id", worker_id)?;
        let job = self
            .repository
            .complete_external_job(job_id, worker_id, &self.continuation_handler_type, variables)
            .await?;
        info!(variables = variables.len(), "External worker job completed");
        Ok(job)
    }

    /// Record a failure reported by the worker holding the job.
    #[instrument(skip(self, failure))]
    pub async fn fail(&self, job_id: &str, worker_id: &str, failure: &ExternalJobFailure) -> AppResult<Job> {
        require("worker_id", worker_id)?;
        if failure.retries.is_some_and(|retries| retries < 0) {
            return Err(AppError::validation("retries", "Retries cannot be negative"));
        }
        let job = self
            .repository
            .fail_external_job(job_id, worker_id, failure, self.clock.now())
            .await?;
        warn!(
            state = %job.state,
            retries = job.retries,
            error = failure.error_message.as_deref().unwrap_or_default(),
            "External worker job failed"
        );
        Ok(job)
    }

    /// Give a held job back without using up a retry.
    pub async fn unacquire(&self, job_id: &str, worker_id: &str) -> AppResult<Job> {
        require("worker_id", worker_id)?;
        self.repository.unacquire_external_job(job_id, worker_id).await
    }

    /// Give back every job `worker_id` holds, optionally within one tenant.
    pub async fn unacquire_all(&self, worker_id: &str, tenant_id: Option<&str>) -> AppResult<u64> {
        require("worker_id", worker_id)?;
        let released = self
            .repository
            .unacquire_all_external_jobs(worker_id, tenant_id)
            .await?;
        info!(worker_id, released, "Released external worker jobs");
        Ok(released)
    }

    /// Push the lease on a held job to `now + lock_duration`.
    pub async fn extend_lock(&self, job_id: &str, worker_id: &str, lock_duration: Duration) -> AppResult<Job> {
        require("worker_id", worker_id)?;
        if lock_duration.is_zero() {
            return Err(AppError::validation("lock_duration", "Must be positive"));
        }
        let expiration = clock::plus(self.clock.now(), lock_duration);
        self.repository
            .extend_external_job_lock(job_id, worker_id, expiration)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::types::{JobState, NewJob};
    use crate::repositories::MemoryJobRepository;
    use jiff::Timestamp;

    struct Fixture {
        clock: ManualClock,
        repository: Arc<MemoryJobRepository>,
        service: ExternalWorkerService,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Timestamp::from_second(1_700_000_000).unwrap());
        let repository = Arc::new(MemoryJobRepository::new());
        let service = ExternalWorkerService::new(
            repository.clone(),
            Arc::new(clock.clone()),
            ExternalWorkerSettings::default(),
        );
        Fixture {
            clock,
            repository,
            service,
        }
    }

    async fn external_job(fx: &Fixture, id: &str, topic: &str) -> Job {
        let job = NewJob::new("external")
            .with_configuration(topic)
            .with_scope("proc-1", "bpmn")
            .with_retries(2)
            .into_job(id.to_string(), JobState::ExternalWorker, 3, fx.clock.now());
        fx.repository.insert_job(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_acquire_locks_matching_topic_only() {
        let fx = fixture();
        external_job(&fx, "e1", "invoices").await;
        external_job(&fx, "e2", "shipping").await;

        let request = AcquireRequest::new("invoices", "worker-a")
            .with_number_of_tasks(5)
            .with_lock_duration(Duration::from_secs(60));
        let acquired = fx.service.acquire_and_lock(&request).await.unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].job.id, "e1");
        assert_eq!(acquired[0].job.lock_owner.as_deref(), Some("worker-a"));
        assert_eq!(
            acquired[0].job.lock_expiration_time,
            Some(clock::plus(fx.clock.now(), Duration::from_secs(60)))
        );

        let again = fx.service.acquire_and_lock(&request).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_validates_request() {
        let fx = fixture();
        let too_many = AcquireRequest::new("t", "w").with_number_of_tasks(10_000);
        assert!(fx.service.acquire_and_lock(&too_many).await.is_err());
        let blank = AcquireRequest::new(" ", "w");
        assert!(fx.service.acquire_and_lock(&blank).await.is_err());
        let zero = AcquireRequest::new("t", "w").with_number_of_tasks(0);
        assert!(fx.service.acquire_and_lock(&zero).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_by_other_worker_is_forbidden_and_mutates_nothing() {
        let fx = fixture();
        external_job(&fx, "e1", "invoices").await;
        fx.service
            .acquire_and_lock(&AcquireRequest::new("invoices", "worker-a"))
            .await
            .unwrap();
        let before = fx.repository.find_job("e1").await.unwrap().unwrap();

        let variables = vec![Variable::from_json("approved", serde_json::json!(true))];
        let err = fx
            .service
            .complete("e1", "worker-b", &variables)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden { .. }));
        assert_eq!(fx.repository.find_job("e1").await.unwrap().unwrap(), before);
        assert!(fx.repository.scope_variables("proc-1").await.unwrap().is_empty());

        let completed = fx.service.complete("e1", "worker-a", &variables).await.unwrap();
        assert_eq!(completed.state, JobState::Ready);
        assert_eq!(completed.handler_type, EXTERNAL_WORKER_COMPLETE);
        assert!(completed.lock_owner.is_none());
        assert_eq!(fx.repository.scope_variables("proc-1").await.unwrap(), variables);
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let fx = fixture();
        external_job(&fx, "e1", "invoices").await;
        let request = AcquireRequest::new("invoices", "worker-a");
        fx.service.acquire_and_lock(&request).await.unwrap();

        let failure = ExternalJobFailure {
            error_message: Some("remote failure".to_string()),
            retry_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let failed = fx.service.fail("e1", "worker-a", &failure).await.unwrap();
        assert_eq!(failed.state, JobState::ExternalWorker);
        assert_eq!(failed.retries, 1);
        assert!(failed.lock_owner.is_none());

        // not acquirable until the retry timeout passes
        assert!(fx.service.acquire_and_lock(&request).await.unwrap().is_empty());
        fx.clock.advance(Duration::from_secs(30));
        assert_eq!(fx.service.acquire_and_lock(&request).await.unwrap().len(), 1);

        let last = ExternalJobFailure {
            retries: Some(0),
            ..failure
        };
        let dead = fx.service.fail("e1", "worker-a", &last).await.unwrap();
        assert_eq!(dead.state, JobState::DeadLetter);
    }

    #[tokio::test]
    async fn test_unacquire_extend_and_release_all() {
        let fx = fixture();
        external_job(&fx, "e1", "invoices").await;
        external_job(&fx, "e2", "invoices").await;
        let request = AcquireRequest::new("invoices", "worker-a").with_number_of_tasks(2);
        fx.service.acquire_and_lock(&request).await.unwrap();

        let extended = fx
            .service
            .extend_lock("e1", "worker-a", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            extended.lock_expiration_time,
            Some(clock::plus(fx.clock.now(), Duration::from_secs(3600)))
        );
        assert!(matches!(
            fx.service.extend_lock("e1", "worker-b", Duration::from_secs(1)).await,
            Err(AppError::Forbidden { .. })
        ));

        let released = fx.service.unacquire("e1", "worker-a").await.unwrap();
        assert!(released.lock_owner.is_none());
        assert_eq!(released.retries, 2);

        assert_eq!(fx.service.unacquire_all("worker-a", None).await.unwrap(), 1);
        assert!(matches!(
            fx.service.unacquire("missing", "worker-a").await,
            Err(AppError::NotFound { .. })
        ));
    }
}
