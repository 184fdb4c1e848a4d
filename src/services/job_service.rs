//! Job creation and administration.

use std::sync::Arc;

use jiff::Timestamp;
use tracing::info;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::id::IdGenerator;
use crate::jobs::types::{Job, JobQuery, JobState, NewJob};
use crate::repositories::{JobMove, JobRepository};

/// States an operator may move to dead letter by hand
const DEAD_LETTER_SOURCES: [JobState; 5] = [
    JobState::Ready,
    JobState::Timer,
    JobState::Suspended,
    JobState::History,
    JobState::ExternalWorker,
];

/// Job service for creating jobs and operator actions on them.
///
/// Cloning is cheap; every collaborator sits behind an `Arc`.
#[derive(Clone, Debug)]
pub struct JobService {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_retries: i32,
}

impl JobService {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        default_retries: i32,
    ) -> Self {
        Self {
            repository,
            clock,
            ids,
            default_retries,
        }
    }

    async fn create(&self, new_job: NewJob, state: JobState) -> AppResult<Job> {
        new_job.validate()?;
        let job = new_job.into_job(self.ids.next_id(), state, self.default_retries, self.clock.now());
        let job = self.repository.insert_job(job).await?;
        info!(
            job.id = %job.id,
            job.handler_type = %job.handler_type,
            state = %job.state,
            "Job created"
        );
        Ok(job)
    }

    /// Create a job that is eligible for execution immediately.
    pub async fn create_async_job(&self, new_job: NewJob) -> AppResult<Job> {
        self.create(NewJob { due_date: None, ..new_job }, JobState::Ready).await
    }

    /// Create a job that becomes eligible at its due date.
    ///
    /// # Errors
    /// `Validation` when the job has no due date
    pub async fn create_timer_job(&self, new_job: NewJob) -> AppResult<Job> {
        if new_job.due_date.is_none() {
            return Err(AppError::validation("due_date", "Timer jobs require a due date"));
        }
        self.create(new_job, JobState::Timer).await
    }

    pub async fn create_history_job(&self, new_job: NewJob) -> AppResult<Job> {
        self.create(new_job, JobState::History).await
    }

    /// Create a job for external workers; its configuration is the topic
    pub async fn create_external_worker_job(&self, new_job: NewJob) -> AppResult<Job> {
        let has_topic = new_job
            .handler_configuration
            .as_deref()
            .is_some_and(|topic| !topic.trim().is_empty());
        if !has_topic {
            return Err(AppError::validation(
                "handler_configuration",
                "External worker jobs require a topic",
            ));
        }
        self.create(new_job, JobState::ExternalWorker).await
    }

    /// Return the job carrying `new_job`'s correlation id, creating it in
    /// `state` when there is none. Safe against concurrent callers.
    pub async fn find_or_create_by_correlation_id(
        &self,
        new_job: NewJob,
        state: JobState,
    ) -> AppResult<Job> {
        let Some(correlation_id) = new_job.correlation_id.clone() else {
            return Err(AppError::validation(
                "correlation_id",
                "A correlation id is required for find-or-create",
            ));
        };
        if let Some(existing) = self.repository.find_by_correlation_id(&correlation_id).await? {
            return Ok(existing);
        }

        match self.create(new_job, state).await {
            Err(AppError::Duplicate { .. }) => self
                .repository
                .find_by_correlation_id(&correlation_id)
                .await?
                .ok_or_else(|| AppError::NotFound {
                    entity: "Job".to_string(),
                    field: "correlation_id".to_string(),
                    value: correlation_id,
                }),
            other => other,
        }
    }

    pub async fn get_job(&self, id: &str) -> AppResult<Job> {
        self.repository
            .find_job(id)
            .await?
            .ok_or_else(|| AppError::job_not_found(id))
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> AppResult<Vec<Job>> {
        self.repository.query_jobs(query).await
    }

    pub async fn count_jobs(&self, query: &JobQuery) -> AppResult<i64> {
        self.repository.count_jobs(query).await
    }

    /// Apply `job_move`, telling a missing job apart from one in the wrong state
    async fn apply_move(&self, id: &str, job_move: JobMove) -> AppResult<Job> {
        if let Some(job) = self.repository.move_job(id, &job_move).await? {
            info!(job.id = %id, to = %job_move.to, "Job moved");
            return Ok(job);
        }
        let job = self.get_job(id).await?;
        Err(AppError::BadRequest {
            message: format!("Job {} is {} and cannot be moved to {}", id, job.state, job_move.to),
        })
    }

    /// Move a dead letter back to READY with fresh retries.
    pub async fn retry_dead_letter(&self, id: &str, retries: Option<i32>) -> AppResult<Job> {
        let retries = retries.unwrap_or(self.default_retries);
        if retries <= 0 {
            return Err(AppError::validation("retries", "Retries must be positive"));
        }
        let job_move = JobMove::new(&[JobState::DeadLetter], JobState::Ready, self.clock.now())
            .with_retries(retries)
            .with_due_date(None);
        self.apply_move(id, job_move).await
    }

    pub async fn move_to_dead_letter(&self, id: &str) -> AppResult<Job> {
        self.apply_move(id, JobMove::new(&DEAD_LETTER_SOURCES, JobState::DeadLetter, self.clock.now()))
            .await
    }

    /// Exclude a READY or TIMER job from acquisition.
    pub async fn suspend_job(&self, id: &str) -> AppResult<Job> {
        self.apply_move(id, JobMove::new(
            &[JobState::Ready, JobState::Timer],
            JobState::Suspended,
            self.clock.now(),
        ))
            .await
    }

    /// Return a suspended job to TIMER when its due date is still ahead,
    /// READY otherwise.
    pub async fn activate_job(&self, id: &str) -> AppResult<Job> {
        let job = self.get_job(id).await?;
        let now = self.clock.now();
        let target = match job.due_date {
            Some(due) if due > now => JobState::Timer,
            _ => JobState::Ready,
        };
        self.apply_move(id, JobMove::new(&[JobState::Suspended], target, now))
            .await
    }

    /// Overwrite a job's retry count, failing if it changed concurrently.
    pub async fn set_retries(&self, id: &str, retries: i32) -> AppResult<Job> {
        if retries < 0 {
            return Err(AppError::validation("retries", "Retries cannot be negative"));
        }
        let mut job = self.get_job(id).await?;
        job.retries = retries;
        self.repository.update_job(&job).await
    }

    pub async fn delete_job(&self, id: &str) -> AppResult<()> {
        if self.repository.delete_job(id).await? {
            info!(job.id = %id, "Job deleted");
            Ok(())
        } else {
            Err(AppError::job_not_found(id))
        }
    }

    /// Delete every job of a scope, e.g. when its process instance ends
    pub async fn delete_jobs_by_scope(&self, scope_id: &str, sub_scope_id: Option<&str>) -> AppResult<u64> {
        let deleted = self.repository.delete_jobs_by_scope(scope_id, sub_scope_id).await?;
        info!(scope_id, deleted, "Deleted jobs of scope");
        Ok(deleted)
    }

    pub async fn update_tenant_for_deployment(
        &self,
        deployment_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64> {
        self.repository
            .update_tenant_for_deployment(deployment_id, tenant_id)
            .await
    }

    pub async fn delete_dead_letters_before(&self, cutoff: Timestamp, max_results: usize) -> AppResult<u64> {
        self.repository
            .delete_dead_letter_jobs_before(cutoff, max_results)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{self, ManualClock};
    use crate::id::UuidIdGenerator;
    use crate::repositories::MemoryJobRepository;
    use std::time::Duration;

    fn service() -> (JobService, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_second(1_700_000_000).unwrap());
        let service = JobService::new(
            Arc::new(MemoryJobRepository::new()),
            Arc::new(clock.clone()),
            Arc::new(UuidIdGenerator),
            3,
        );
        (service, clock)
    }

    #[tokio::test]
    async fn test_create_applies_default_retries() {
        let (service, _) = service();
        let job = service.create_async_job(NewJob::new("noop")).await.unwrap();
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.retries, 3);
        assert_eq!(service.get_job(&job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_jobs() {
        let (service, _) = service();
        let err = service.create_timer_job(NewJob::new("noop")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        let err = service.create_async_job(NewJob::new(" ")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        let err = service
            .create_external_worker_job(NewJob::new("external"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let (service, clock) = service();
        let due = clock::plus(clock.now(), Duration::from_secs(60));
        let new_job = NewJob::new("timer-boundary")
            .with_due_date(due)
            .with_correlation_id("boundary-1");

        let first = service
            .find_or_create_by_correlation_id(new_job.clone(), JobState::Timer)
            .await
            .unwrap();
        let second = service
            .find_or_create_by_correlation_id(new_job, JobState::Timer)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(service.count_jobs(&JobQuery::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_round_trip() {
        let (service, clock) = service();
        let job = service.create_async_job(NewJob::new("noop")).await.unwrap();

        let dead = service.move_to_dead_letter(&job.id).await.unwrap();
        assert_eq!(dead.state, JobState::DeadLetter);
        assert_eq!(dead.dead_letter_time, Some(clock.now()));

        let revived = service.retry_dead_letter(&job.id, Some(5)).await.unwrap();
        assert_eq!(revived.state, JobState::Ready);
        assert_eq!(revived.retries, 5);
        assert_eq!(revived.failed_attempts, 0);
        assert!(revived.dead_letter_time.is_none());

        let err = service.retry_dead_letter(&job.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest { .. }));
        let err = service.retry_dead_letter("missing", None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_suspend_and_activate_restore_timer() {
        let (service, clock) = service();
        let due = clock::plus(clock.now(), Duration::from_secs(60));
        let job = service
            .create_timer_job(NewJob::new("noop").with_due_date(due))
            .await
            .unwrap();

        assert_eq!(service.suspend_job(&job.id).await.unwrap().state, JobState::Suspended);
        assert_eq!(service.activate_job(&job.id).await.unwrap().state, JobState::Timer);

        service.suspend_job(&job.id).await.unwrap();
        clock.advance(Duration::from_secs(120));
        assert_eq!(service.activate_job(&job.id).await.unwrap().state, JobState::Ready);
    }

    #[tokio::test]
    async fn test_set_retries_and_delete() {
        let (service, _) = service();
        let job = service.create_async_job(NewJob::new("noop")).await.unwrap();

        let updated = service.set_retries(&job.id, 7).await.unwrap();
        assert_eq!(updated.retries, 7);
        assert_eq!(updated.revision, job.revision + 1);
        assert!(service.set_retries(&job.id, -1).await.is_err());

        service.delete_job(&job.id).await.unwrap();
        assert!(matches!(
            service.delete_job(&job.id).await.unwrap_err(),
            AppError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_jobs_by_scope() {
        let (service, _) = service();
        for sub in ["exec-1", "exec-2"] {
            service
                .create_async_job(NewJob::new("noop").with_scope("proc-1", "bpmn").with_sub_scope(sub))
                .await
                .unwrap();
        }
        service
            .create_async_job(NewJob::new("noop").with_scope("proc-2", "bpmn"))
            .await
            .unwrap();

        assert_eq!(service.delete_jobs_by_scope("proc-1", Some("exec-1")).await.unwrap(), 1);
        assert_eq!(service.delete_jobs_by_scope("proc-1", None).await.unwrap(), 1);
        assert_eq!(service.count_jobs(&JobQuery::default()).await.unwrap(), 1);
    }
}
