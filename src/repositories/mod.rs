//! Job Data Manager: every read and write of job state goes through
//! [`JobRepository`].
//!
//! State transitions are single guarded writes. Methods that can lose a
//! race against another executor report it as a value (`false`, a shorter
//! `Vec`) rather than an error; callers pass `now` so implementations never
//! read a clock themselves.

mod job_repo;
mod memory_repo;

pub use job_repo::PgJobRepository;
pub use memory_repo::MemoryJobRepository;

use async_trait::async_trait;
use jiff::Timestamp;

use crate::error::AppResult;
use crate::jobs::types::{
    CompletionEffects, ExternalJobAcquisition, ExternalJobFailure, FailureTarget, Job,
    JobExecutionScope, JobFailure, JobQuery, JobState, Variable,
};

/// Administrative move of a job between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMove {
    /// The move only applies while the job is in one of these states
    pub from: Vec<JobState>,
    pub to: JobState,
    /// Replaces the retry count when set
    pub retries: Option<i32>,
    /// Replaces the due date when set
    pub due_date: Option<Option<Timestamp>>,
    pub moved_at: Timestamp,
}

impl JobMove {
    pub fn new(from: &[JobState], to: JobState, moved_at: Timestamp) -> Self {
        Self {
            from: from.to_vec(),
            to,
            retries: None,
            due_date: None,
            moved_at,
        }
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_due_date(mut self, due_date: Option<Timestamp>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Apply to an in-memory copy; the lock is always released. Fresh
    /// retries restart the backoff.
    pub(crate) fn apply(&self, job: &mut Job) {
        job.state = self.to;
        job.clear_lock();
        if let Some(retries) = self.retries {
            job.retries = retries;
            job.failed_attempts = 0;
        }
        job.dead_letter_time = (self.to == JobState::DeadLetter).then_some(self.moved_at);
        if let Some(due_date) = self.due_date {
            job.due_date = due_date;
        }
        job.revision += 1;
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync + std::fmt::Debug {
    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    async fn insert_job(&self, job: Job) -> AppResult<Job>;

    async fn find_job(&self, id: &str) -> AppResult<Option<Job>>;

    async fn find_by_correlation_id(&self, correlation_id: &str) -> AppResult<Option<Job>>;

    /// Revision-checked full update; `OptimisticLock` when the stored
    /// revision differs from `job.revision`.
    async fn update_job(&self, job: &Job) -> AppResult<Job>;

    /// Returns whether a row was deleted
    async fn delete_job(&self, id: &str) -> AppResult<bool>;

    async fn query_jobs(&self, query: &JobQuery) -> AppResult<Vec<Job>>;

    async fn count_jobs(&self, query: &JobQuery) -> AppResult<i64>;

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Unlocked or lock-expired jobs in `states`, oldest first
    async fn find_jobs_to_execute(
        &self,
        states: &[JobState],
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>>;

    /// Conditional claim of each id still in `states` and unlocked or
    /// expired at `now`. Returns the ids actually claimed.
    async fn bulk_update_job_lock(
        &self,
        ids: &[String],
        states: &[JobState],
        lock_owner: &str,
        lock_expiration_time: Timestamp,
        now: Timestamp,
    ) -> AppResult<Vec<String>>;

    /// Timers whose due date has passed and that are not locked by others
    async fn find_due_timer_jobs(
        &self,
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>>;

    /// Move a due timer to ready. False when it is no longer a due timer or
    /// someone else holds it.
    async fn promote_timer_job(
        &self,
        id: &str,
        lock_owner: Option<&str>,
        now: Timestamp,
    ) -> AppResult<bool>;

    /// Locked jobs whose lock expired before `expired_before`
    async fn find_expired_jobs(
        &self,
        scope: &JobExecutionScope,
        expired_before: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>>;

    /// Clear the lock of a job still expired before `expired_before`
    async fn reset_expired_job(&self, id: &str, expired_before: Timestamp) -> AppResult<bool>;

    /// Release a lock held by `lock_owner` without touching retries
    async fn release_job_lock(&self, id: &str, lock_owner: &str) -> AppResult<bool>;

    // ------------------------------------------------------------------
    // Execution outcome
    // ------------------------------------------------------------------

    /// Delete the executable job held by `lock_owner` and apply `effects`
    /// in the same transaction. False, with nothing applied, when the job
    /// is gone or no longer held by `lock_owner`.
    async fn complete_job(
        &self,
        id: &str,
        lock_owner: &str,
        effects: CompletionEffects,
    ) -> AppResult<bool>;

    /// Record a failure for a job held by `failure.lock_owner` and move it
    /// to the failure target. False when the job is gone or not held.
    async fn fail_job(&self, failure: JobFailure) -> AppResult<bool>;

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Returns the moved job, or `None` when it is missing or not in a
    /// source state
    async fn move_job(&self, id: &str, job_move: &JobMove) -> AppResult<Option<Job>>;

    async fn find_jobs_by_scope(
        &self,
        scope_id: &str,
        sub_scope_id: Option<&str>,
    ) -> AppResult<Vec<Job>>;

    /// Delete jobs of a scope in every state. Returns the number removed.
    async fn delete_jobs_by_scope(&self, scope_id: &str, sub_scope_id: Option<&str>)
    -> AppResult<u64>;

    async fn update_tenant_for_deployment(
        &self,
        deployment_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64>;

    /// Delete up to `max_results` dead letters dead-lettered before `cutoff`
    async fn delete_dead_letter_jobs_before(
        &self,
        cutoff: Timestamp,
        max_results: usize,
    ) -> AppResult<u64>;

    // ------------------------------------------------------------------
    // External workers
    // ------------------------------------------------------------------

    /// Claim matching external jobs for a worker; returns them as locked
    async fn acquire_external_jobs(
        &self,
        acquisition: &ExternalJobAcquisition,
        now: Timestamp,
    ) -> AppResult<Vec<Job>>;

    /// Move an external job held by `worker_id` to ready under
    /// `continuation_handler_type` and store `variables` in its scope.
    ///
    /// `NotFound` when the job is not an external job, `Forbidden` when
    /// another worker (or nobody) holds it; neither mutates anything.
    async fn complete_external_job(
        &self,
        id: &str,
        worker_id: &str,
        continuation_handler_type: &str,
        variables: &[Variable],
    ) -> AppResult<Job>;

    /// Record a worker-reported failure; same ownership rules as completion
    async fn fail_external_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &ExternalJobFailure,
        now: Timestamp,
    ) -> AppResult<Job>;

    /// Release a lease early without consuming a retry
    async fn unacquire_external_job(&self, id: &str, worker_id: &str) -> AppResult<Job>;

    /// Release every lease held by `worker_id`, optionally within a tenant
    async fn unacquire_all_external_jobs(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64>;

    /// Renew a lease held by `worker_id`
    async fn extend_external_job_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_expiration_time: Timestamp,
    ) -> AppResult<Job>;

    // ------------------------------------------------------------------
    // Scope variables
    // ------------------------------------------------------------------

    async fn scope_variables(&self, scope_id: &str) -> AppResult<Vec<Variable>>;
}

/// Ownership rule shared by the external worker operations
pub(crate) fn check_external_owner(
    job: Option<&Job>,
    id: &str,
    worker_id: &str,
) -> AppResult<()> {
    use crate::error::AppError;

    let job = match job {
        Some(job) if job.state == JobState::ExternalWorker => job,
        _ => {
            return Err(AppError::NotFound {
                entity: "ExternalWorkerJob".to_string(),
                field: "id".to_string(),
                value: id.to_string(),
            });
        }
    };

    match job.lock_owner.as_deref() {
        Some(owner) if owner == worker_id => Ok(()),
        Some(owner) => Err(AppError::forbidden(format!(
            "Job {} is locked by worker '{}', not '{}'",
            id, owner, worker_id
        ))),
        None => Err(AppError::forbidden(format!(
            "Job {} is not locked by worker '{}'",
            id, worker_id
        ))),
    }
}

/// Apply a failure target to a job image; shared by both repositories
pub(crate) fn apply_failure(
    job: &mut Job,
    target: &FailureTarget,
    message: Option<String>,
    stacktrace: Option<String>,
    failed_at: Timestamp,
) {
    job.state = target.state_for(job.state);
    job.failed_attempts = job.failed_attempts.saturating_add(1);
    match target {
        FailureTarget::Timer { retries, due_date } => {
            job.retries = *retries;
            job.due_date = Some(*due_date);
        }
        FailureTarget::InPlace { retries, due_date } => {
            job.retries = *retries;
            if due_date.is_some() {
                job.due_date = *due_date;
            }
        }
        FailureTarget::DeadLetter => {
            job.retries = 0;
            job.dead_letter_time = Some(failed_at);
        }
    }
    job.exception_message = message;
    job.exception_stacktrace = stacktrace;
    job.clear_lock();
    job.revision += 1;
}
