use async_trait::async_trait;

use crate::jobs::handler::{HandlerOutcome, HandlerResult, JobContext, JobHandler};

/// Handler type an external worker job turns into once its worker completes it
pub const EXTERNAL_WORKER_COMPLETE: &str = "external-worker-complete";

/// Default continuation for completed external worker jobs.
///
/// The result variables were already written with the completion, so there
/// is nothing left to do unless an embedding engine registers its own
/// handler under this type.
#[derive(Debug, Default)]
pub struct ExternalWorkerCompleteHandler;

#[async_trait]
impl JobHandler for ExternalWorkerCompleteHandler {
    fn handler_type(&self) -> &str {
        EXTERNAL_WORKER_COMPLETE
    }

    async fn execute(&self, ctx: JobContext) -> HandlerResult {
        tracing::debug!(
            job.id = %ctx.job.id,
            scope_id = ctx.job.scope_id.as_deref().unwrap_or_default(),
            topic = ctx.configuration().unwrap_or_default(),
            "External worker job continuation"
        );
        Ok(HandlerOutcome::done())
    }
}
