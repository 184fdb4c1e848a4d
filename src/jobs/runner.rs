//! Job execution runner: runs one claimed job and records the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::Clock;
use crate::error::AppResult;
use crate::id::IdGenerator;
use crate::jobs::handler::{HandlerError, HandlerOutcome, JobContext};
use crate::jobs::registry::JobHandlerRegistry;
use crate::jobs::retry::{RetryPolicy, failure_target};
use crate::jobs::types::{
    CompletionEffects, FailureTarget, Job, JobFailure, JobState, NewJob, ScopeVariableWrite,
};
use crate::repositories::JobRepository;

/// What became of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded and the job is gone
    Completed,
    /// Handler failed; the job waits for another attempt
    FailedRetryable,
    /// Handler failed for good; the job is a dead letter
    FailedTerminal,
    /// The job vanished or changed hands before the outcome could be written
    Abandoned,
}

#[derive(Clone)]
pub struct JobExecutionRunner {
    repository: Arc<dyn JobRepository>,
    registry: Arc<JobHandlerRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retry_policy: Arc<dyn RetryPolicy>,
    default_retries: i32,
    handler_timeout: Option<Duration>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for JobExecutionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionRunner")
            .field("registry", &self.registry)
            .field("retry_policy", &self.retry_policy)
            .field("default_retries", &self.default_retries)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

impl JobExecutionRunner {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        registry: Arc<JobHandlerRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        retry_policy: Arc<dyn RetryPolicy>,
        default_retries: i32,
    ) -> Self {
        Self {
            repository,
            registry,
            clock,
            ids,
            retry_policy,
            default_retries,
            handler_timeout: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Token handed to handlers; cancelled when the executor shuts down
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Execute `job`, which this runner's caller claimed as `lock_owner`.
    ///
    /// Lost races surface as [`ExecutionOutcome::Abandoned`]; only
    /// repository failures are errors.
    pub async fn execute(&self, job: Job, lock_owner: &str) -> AppResult<ExecutionOutcome> {
        let span = info_span!(
            "job_execution",
            job.id = %job.id,
            job.handler_type = %job.handler_type,
            lock_owner = %lock_owner
        );
        self.execute_inner(job, lock_owner).instrument(span).await
    }

    async fn execute_inner(&self, claimed: Job, lock_owner: &str) -> AppResult<ExecutionOutcome> {
        let Some(job) = self.repository.find_job(&claimed.id).await? else {
            debug!("Job disappeared before execution");
            return Ok(ExecutionOutcome::Abandoned);
        };
        if !job.state.is_executable() || !job.is_locked_by(lock_owner) {
            debug!(
                state = %job.state,
                current_owner = job.lock_owner.as_deref().unwrap_or_default(),
                "Job lock no longer held"
            );
            return Ok(ExecutionOutcome::Abandoned);
        }

        let Some(handler) = self.registry.lookup(&job.handler_type) else {
            let error = HandlerError::configuration(format!(
                "No handler registered for job handler type '{}'",
                job.handler_type
            ));
            return self.record_failure(&job, lock_owner, error).await;
        };

        let ctx = JobContext {
            job: job.clone(),
            lock_owner: lock_owner.to_string(),
            clock: Arc::clone(&self.clock),
            repository: Arc::clone(&self.repository),
            cancellation_token: self.cancellation_token.child_token(),
        };

        let started = Instant::now();
        let run = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Ok(Err(HandlerError::failed(format!(
                    "Job handler timed out after {}ms",
                    limit.as_millis()
                )))),
            },
            None => run.await,
        };
        let result = result.unwrap_or_else(|panic| Err(HandlerError::failed(panic_message(panic.as_ref()))));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => match self.completion_effects(&job, outcome) {
                Ok(effects) => {
                    if self.repository.complete_job(&job.id, lock_owner, effects).await? {
                        info!(elapsed_ms, "Job completed");
                        Ok(ExecutionOutcome::Completed)
                    } else {
                        debug!("Job changed hands before completion was recorded");
                        Ok(ExecutionOutcome::Abandoned)
                    }
                }
                Err(error) => self.record_failure(&job, lock_owner, error).await,
            },
            Err(HandlerError::Cancelled) if self.cancellation_token.is_cancelled() => {
                // outcome of the interrupted work is unknown; the lock expires on its own
                warn!(elapsed_ms, "Job interrupted by shutdown, lock kept until expiry");
                Ok(ExecutionOutcome::Abandoned)
            }
            Err(HandlerError::Cancelled) => {
                self.repository.release_job_lock(&job.id, lock_owner).await?;
                info!(elapsed_ms, "Job cancelled, lock released");
                Ok(ExecutionOutcome::Abandoned)
            }
            Err(error) => {
                warn!(elapsed_ms, error = %error, "Job handler failed");
                self.record_failure(&job, lock_owner, error).await
            }
        }
    }

    /// Turn a handler's declared effects into rows for the completion write
    fn completion_effects(
        &self,
        job: &Job,
        outcome: HandlerOutcome,
    ) -> Result<CompletionEffects, HandlerError> {
        let now = self.clock.now();
        let mut effects = CompletionEffects::default();

        if !outcome.variables.is_empty() {
            let (scope_id, scope_type) = job.variable_scope();
            effects.variables.push(ScopeVariableWrite {
                scope_id,
                scope_type,
                variables: outcome.variables,
            });
        }

        for follow_up in outcome.follow_up_jobs {
            let state = match follow_up.due_date {
                Some(due) if due > now => JobState::Timer,
                _ => JobState::Ready,
            };
            effects.new_jobs.push(self.materialize(job, follow_up, state)?);
        }
        if let Some(history) = outcome.history_job {
            effects
                .new_jobs
                .push(self.materialize(job, history, JobState::History)?);
        }
        Ok(effects)
    }

    fn materialize(&self, parent: &Job, new_job: NewJob, state: JobState) -> Result<Job, HandlerError> {
        new_job
            .validate()
            .map_err(|e| HandlerError::configuration(e.to_string()))?;
        Ok(new_job.inheriting_from(parent).into_job(
            self.ids.next_id(),
            state,
            self.default_retries,
            self.clock.now(),
        ))
    }

    async fn record_failure(
        &self,
        job: &Job,
        lock_owner: &str,
        error: HandlerError,
    ) -> AppResult<ExecutionOutcome> {
        let now = self.clock.now();
        let target = failure_target(job, &error, self.retry_policy.as_ref(), now);
        let terminal = target == FailureTarget::DeadLetter;

        let failure = JobFailure {
            job_id: job.id.clone(),
            lock_owner: lock_owner.to_string(),
            exception_message: error.to_string(),
            exception_stacktrace: error.details(),
            target: target.clone(),
            failed_at: now,
        };
        if !self.repository.fail_job(failure).await? {
            debug!("Job changed hands before failure was recorded");
            return Ok(ExecutionOutcome::Abandoned);
        }

        if terminal {
            error!(error = %error, "Job moved to dead letter");
            Ok(ExecutionOutcome::FailedTerminal)
        } else {
            if let FailureTarget::Timer { retries, due_date } = &target {
                info!(retries, due_date = %due_date, "Job rescheduled");
            }
            Ok(ExecutionOutcome::FailedRetryable)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Job handler panicked: {}", detail)
}
