//! Service layer over the job repository.
//!
//! Services validate caller input, log what they change and turn "no such
//! row" into the errors an external caller should see.

mod external_worker_service;
mod job_service;

pub use external_worker_service::{AcquireRequest, AcquiredJob, ExternalWorkerService};
pub use job_service::JobService;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Settings;
use crate::id::IdGenerator;
use crate::repositories::JobRepository;

/// Aggregates all services for convenient access.
///
/// Cloning is cheap since every service holds its collaborators in `Arc`s.
#[derive(Clone, Debug)]
pub struct Services {
    pub jobs: JobService,
    pub external_workers: ExternalWorkerService,
}

impl Services {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: &Settings,
    ) -> Self {
        Self {
            jobs: JobService::new(
                Arc::clone(&repository),
                Arc::clone(&clock),
                ids,
                settings.executor.retry.default_retries,
            ),
            external_workers: ExternalWorkerService::new(
                repository,
                clock,
                settings.external_worker.clone(),
            ),
        }
    }
}
