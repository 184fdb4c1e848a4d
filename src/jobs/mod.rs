pub mod acquisition;
pub mod async_executor;
pub mod handler;
pub mod models;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod tasks;
pub mod types;
pub mod worker_pool;


pub use acquisition::{AcquisitionConfig, AcquisitionEngine, TimerCycle};
pub use async_executor::{AsyncExecutor, ExecutorState, IdleBackoff, LoopSettings};
pub use handler::{HandlerError, HandlerOutcome, HandlerResult, JobContext, JobHandler, JobTask};
pub use registry::JobHandlerRegistry;
pub use retry::{ExponentialBackoff, FixedDelay, RetryPolicy, failure_target};
pub use runner::{ExecutionOutcome, JobExecutionRunner};
pub use types::{
    ExternalJobAcquisition, ExternalJobFailure, FailureTarget, Job, JobExecutionScope, JobQuery,
    JobState, NewJob, Variable,
};
pub use worker_pool::WorkerPool;
