use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::jobs::handler::{HandlerOutcome, HandlerResult, JobContext, JobTask};
use crate::jobs::types::NewJob;

/// Deletes dead letters older than the retention period. When a full batch
/// was deleted, schedules itself again to continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCleanupTask {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_retention_days() -> u64 {
    30
}

fn default_batch_size() -> usize {
    500
}

impl Default for DeadLetterCleanupTask {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
        }
    }
}

#[async_trait]
impl JobTask for DeadLetterCleanupTask {
    fn task_type() -> &'static str
    where
        Self: Sized,
    {
        "dead-letter-cleanup"
    }

    async fn execute(&self, ctx: JobContext) -> HandlerResult {
        let retention = Duration::from_secs(self.retention_days * 24 * 60 * 60);
        let cutoff = clock::minus(ctx.now(), retention);
        let deleted = ctx
            .repository
            .delete_dead_letter_jobs_before(cutoff, self.batch_size)
            .await?;

        tracing::info!(
            deleted_count = deleted,
            retention_days = self.retention_days,
            "Dead letter cleanup completed"
        );

        let mut outcome = HandlerOutcome::done();
        if deleted as usize >= self.batch_size {
            let next = NewJob::new(Self::task_type())
                .with_json_configuration(self)?;
            outcome = outcome.with_follow_up(next);
        }
        Ok(outcome)
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Delete dead-letter jobs older than {} days",
            self.retention_days
        ))
    }
}
