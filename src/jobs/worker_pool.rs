//! Bounded pool that runs claimed jobs.
//!
//! At most `max_pool_size` jobs execute at once and at most `queue_capacity`
//! more wait for a worker. Submissions beyond that are handed back to the
//! caller instead of blocking it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::jobs::runner::{ExecutionOutcome, JobExecutionRunner};
use crate::jobs::types::Job;

#[derive(Debug)]
pub struct WorkerPool {
    runner: JobExecutionRunner,
    lock_owner: String,
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    capacity: usize,
    /// job id -> time the job was accepted
    in_flight: Arc<DashMap<String, Instant>>,
    tracker: TaskTracker,
    /// Handed to jobs accepted since the last reopen
    shutdown: Mutex<CancellationToken>,
}

impl WorkerPool {
    pub fn new(
        runner: JobExecutionRunner,
        lock_owner: impl Into<String>,
        max_pool_size: usize,
        queue_capacity: usize,
    ) -> Self {
        let max_pool_size = max_pool_size.max(1);
        let capacity = max_pool_size + queue_capacity;
        Self {
            runner,
            lock_owner: lock_owner.into(),
            workers: Arc::new(Semaphore::new(max_pool_size)),
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accept work again after a drain. Jobs left over from the previous run
    /// keep the token they were started with.
    pub fn reopen(&self) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
        }
        self.tracker.reopen();
    }

    /// Jobs that can be submitted right now without rejection
    pub fn available_capacity(&self) -> usize {
        if self.tracker.is_closed() {
            return 0;
        }
        self.admission.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.in_flight.contains_key(job_id)
    }

    /// Queue `job` for execution, or hand it back when the pool is full or
    /// shutting down.
    pub fn try_submit(&self, job: Job) -> Result<(), Job> {
        if self.tracker.is_closed() {
            return Err(job);
        }
        let Ok(admission) = Arc::clone(&self.admission).try_acquire_owned() else {
            return Err(job);
        };

        self.in_flight.insert(job.id.clone(), Instant::now());

        let runner = self.runner.clone().with_cancellation_token(self.shutdown_token());
        let lock_owner = self.lock_owner.clone();
        let workers = Arc::clone(&self.workers);
        let in_flight = Arc::clone(&self.in_flight);

        self.tracker.spawn(async move {
            let _admission = admission;
            let job_id = job.id.clone();
            match workers.acquire_owned().await {
                Ok(_worker) => match runner.execute(job, &lock_owner).await {
                    Ok(outcome) => {
                        if outcome == ExecutionOutcome::Abandoned {
                            debug!(job.id = %job_id, "Job execution abandoned");
                        }
                    }
                    Err(e) => {
                        error!(job.id = %job_id, error = %e, "Failed to record job outcome");
                    }
                },
                Err(_) => debug!(job.id = %job_id, "Worker pool closed before job started"),
            }
            in_flight.remove(&job_id);
        });
        Ok(())
    }

    /// Signal running handlers to give up
    pub fn cancel_running(&self) {
        self.shutdown_token().cancel();
    }

    /// Stop accepting work and wait for accepted jobs to finish.
    ///
    /// Returns `false` when `timeout` elapsed first; those jobs keep running
    /// and keep their locks until expiry.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{self, Clock, ManualClock};
    use crate::id::UuidIdGenerator;
    use crate::jobs::handler::{HandlerOutcome, HandlerResult, JobContext, JobHandler};
    use crate::jobs::registry::JobHandlerRegistry;
    use crate::jobs::retry::FixedDelay;
    use crate::jobs::types::{JobState, NewJob};
    use crate::repositories::{JobRepository, MemoryJobRepository};
    use async_trait::async_trait;
    use jiff::Timestamp;

    #[derive(Debug)]
    struct Gate {
        open: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for Gate {
        fn handler_type(&self) -> &str {
            "gate"
        }

        async fn execute(&self, _ctx: JobContext) -> HandlerResult {
            let _pass = self.open.acquire().await;
            Ok(HandlerOutcome::done())
        }
    }

    async fn pool(
        max_pool_size: usize,
        queue_capacity: usize,
    ) -> (WorkerPool, Arc<MemoryJobRepository>, Arc<Semaphore>, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_second(1_700_000_000).unwrap());
        let repository = Arc::new(MemoryJobRepository::new());
        let open = Arc::new(Semaphore::new(0));
        let mut registry = JobHandlerRegistry::new();
        registry.register_handler(Arc::new(Gate { open: open.clone() }));

        let runner = JobExecutionRunner::new(
            repository.clone(),
            Arc::new(registry),
            Arc::new(clock.clone()),
            Arc::new(UuidIdGenerator),
            Arc::new(FixedDelay::new(Duration::from_secs(1))),
            3,
        );
        (
            WorkerPool::new(runner, "node-a", max_pool_size, queue_capacity),
            repository,
            open,
            clock,
        )
    }

    async fn claimed(repository: &MemoryJobRepository, clock: &ManualClock, id: &str) -> Job {
        let now = clock.now();
        let job = NewJob::new("gate").into_job(id.to_string(), JobState::Ready, 3, now);
        repository.insert_job(job).await.unwrap();
        repository
            .bulk_update_job_lock(
                &[id.to_string()],
                &[JobState::Ready],
                "node-a",
                clock::plus(now, Duration::from_secs(60)),
                now,
            )
            .await
            .unwrap();
        repository.find_job(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity() {
        let (pool, repository, open, clock) = pool(1, 1).await;
        assert_eq!(pool.capacity(), 2);

        assert!(pool.try_submit(claimed(&repository, &clock, "a").await).is_ok());
        assert!(pool.try_submit(claimed(&repository, &clock, "b").await).is_ok());
        assert_eq!(pool.available_capacity(), 0);

        let rejected = pool
            .try_submit(claimed(&repository, &clock, "c").await)
            .unwrap_err();
        assert_eq!(rejected.id, "c");

        open.add_permits(1);
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(pool.in_flight(), 0);
        assert!(repository.find_job("a").await.unwrap().is_none());
        assert!(repository.find_job("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_jobs() {
        let (pool, repository, _open, clock) = pool(1, 0).await;
        pool.try_submit(claimed(&repository, &clock, "stuck").await)
            .unwrap();
        tokio::task::yield_now().await;

        assert!(!pool.drain(Duration::from_millis(20)).await);
        assert!(pool.is_running("stuck"));
        assert_eq!(pool.available_capacity(), 0);

        let late = claimed(&repository, &clock, "late").await;
        assert!(pool.try_submit(late).is_err());
    }

    #[tokio::test]
    async fn test_reopen_accepts_work_after_drain() {
        let (pool, repository, open, clock) = pool(1, 1).await;
        assert!(pool.drain(Duration::from_millis(20)).await);
        pool.cancel_running();
        assert_eq!(pool.available_capacity(), 0);

        pool.reopen();
        assert_eq!(pool.available_capacity(), 2);
        assert!(!pool.shutdown_token().is_cancelled());

        pool.try_submit(claimed(&repository, &clock, "again").await)
            .unwrap();
        open.add_permits(1);
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert!(repository.find_job("again").await.unwrap().is_none());
    }
}
