//! Contract between the executor and job payloads.

use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::jobs::types::{Job, NewJob, Variable};
use crate::repositories::JobRepository;

/// Failure raised by a job payload
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business failure; the job is retried while it has retries left
    #[error("{message}")]
    Failed {
        message: String,
        details: Option<String>,
    },

    /// Malformed or missing configuration; retrying cannot help
    #[error("Invalid job configuration: {message}")]
    Configuration { message: String },

    /// Work was interrupted by executor shutdown
    #[error("Job execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Configuration { .. })
    }

    /// Text persisted as the job's exception stacktrace
    pub fn details(&self) -> Option<String> {
        match self {
            HandlerError::Failed { details, .. } => details.clone(),
            HandlerError::Other(source) => Some(format!("{:?}", source)),
            _ => None,
        }
    }
}

impl From<crate::error::AppError> for HandlerError {
    fn from(error: crate::error::AppError) -> Self {
        HandlerError::Other(anyhow::Error::from(error))
    }
}

pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

/// Effects a handler asks for on success. They are committed together with
/// the removal of the job, or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Written to the job's scope
    pub variables: Vec<Variable>,
    /// Inserted as ready, or as timers when they carry a due date
    pub follow_up_jobs: Vec<NewJob>,
    /// Inserted as a history job
    pub history_job: Option<NewJob>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_follow_up(mut self, job: NewJob) -> Self {
        self.follow_up_jobs.push(job);
        self
    }

    pub fn with_history(mut self, job: NewJob) -> Self {
        self.history_job = Some(job);
        self
    }
}

/// Execution context handed to a handler
#[derive(Clone)]
pub struct JobContext {
    pub job: Job,
    /// Identity holding the job's lock for this attempt
    pub lock_owner: String,
    pub clock: Arc<dyn Clock>,
    pub repository: Arc<dyn JobRepository>,
    /// Fires when the executor shuts down
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn configuration(&self) -> Option<&str> {
        self.job.handler_configuration.as_deref()
    }

    /// Current variables of the job's scope
    pub async fn scope_variables(&self) -> Result<Vec<Variable>, HandlerError> {
        let (scope_id, _) = self.job.variable_scope();
        Ok(self.repository.scope_variables(&scope_id).await?)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("handler_type", &self.job.handler_type)
            .field("lock_owner", &self.lock_owner)
            .finish_non_exhaustive()
    }
}

/// A handler registered under a handler type
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(&self, ctx: JobContext) -> HandlerResult;
}

/// Typed job payload; the job's configuration is its JSON form.
#[async_trait]
pub trait JobTask: Send + Sync + std::fmt::Debug {
    /// Handler type this task is registered under
    fn task_type() -> &'static str
    where
        Self: Sized;

    async fn execute(&self, ctx: JobContext) -> HandlerResult;

    /// Human-readable summary logged when the task runs
    fn description(&self) -> Option<String> {
        None
    }
}
