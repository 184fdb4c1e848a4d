//! Jobs command handler
//!
//! Operator access to stored jobs: listing, counting and the manual state
//! moves an operator needs when something is stuck.

use crate::cli::parser::{JobFilterArgs, JobsCommand};
use crate::error::AppResult;
use crate::jobs::{Job, JobQuery};
use crate::services::Services;

const DEFAULT_LIST_LIMIT: i64 = 50;

/// Handler for the `jobs` subcommands
pub struct JobsCommandHandler {
    services: Services,
}

impl JobsCommandHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn execute(&self, command: &JobsCommand) -> AppResult<()> {
        for line in self.run(command).await? {
            println!("{}", line);
        }
        Ok(())
    }

    /// Execute `command` and return the lines to print
    pub async fn run(&self, command: &JobsCommand) -> AppResult<Vec<String>> {
        let jobs = &self.services.jobs;
        let lines = match command {
            JobsCommand::List(filter) => {
                let mut query = filter.to_query();
                query.limit = Some(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));
                let found = jobs.list_jobs(&query).await?;
                let mut lines = Vec::with_capacity(found.len() + 1);
                lines.push(header_row());
                lines.extend(found.iter().map(format_job_row));
                lines
            }
            JobsCommand::Count(filter) => {
                vec![jobs.count_jobs(&filter.to_query()).await?.to_string()]
            }
            JobsCommand::Retry { id, retries } => {
                let job = jobs.retry_dead_letter(id, *retries).await?;
                vec![format!("✓ Job {} moved to {} with {} retries", job.id, job.state, job.retries)]
            }
            JobsCommand::Delete { id } => {
                jobs.delete_job(id).await?;
                vec![format!("✓ Job {} deleted", id)]
            }
            JobsCommand::Suspend { id } => {
                let job = jobs.suspend_job(id).await?;
                vec![format!("✓ Job {} suspended", job.id)]
            }
            JobsCommand::Activate { id } => {
                let job = jobs.activate_job(id).await?;
                vec![format!("✓ Job {} activated into {}", job.id, job.state)]
            }
            JobsCommand::ReleaseWorker { worker_id, tenant } => {
                let released = self
                    .services
                    .external_workers
                    .unacquire_all(worker_id, tenant.as_deref())
                    .await?;
                vec![format!("✓ Released {} job(s) held by {}", released, worker_id)]
            }
        };
        Ok(lines)
    }
}

impl JobFilterArgs {
    fn to_query(&self) -> JobQuery {
        JobQuery {
            states: self.state.into_iter().collect(),
            tenant_id: self.tenant.clone(),
            handler_type: self.handler_type.clone(),
            scope_id: self.scope_id.clone(),
            ..Default::default()
        }
    }
}

fn header_row() -> String {
    format!(
        "{:<36}  {:<15}  {:<24}  {:>7}  {:<25}  {}",
        "ID", "STATE", "HANDLER", "RETRIES", "DUE", "LOCK OWNER"
    )
}

fn format_job_row(job: &Job) -> String {
    format!(
        "{:<36}  {:<15}  {:<24}  {:>7}  {:<25}  {}",
        job.id,
        job.state.as_str(),
        job.handler_type,
        job.retries,
        job.due_date.map(|due| due.to_string()).unwrap_or_else(|| "-".to_string()),
        job.lock_owner.as_deref().unwrap_or("-"),
    )
}
