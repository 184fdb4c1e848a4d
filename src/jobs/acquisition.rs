//! Acquisition engine: timer promotion, async job claims and the
//! expired-lock sweep.
//!
//! Every step goes through a guarded repository write whose result tells
//! this executor whether it won. Losing is normal and is only logged at
//! `debug`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::clock::{self, Clock};
use crate::config::ExecutorSettings;
use crate::error::AppResult;
use crate::jobs::types::{Job, JobExecutionScope, JobState};
use crate::repositories::JobRepository;

/// Knobs for one executor's acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub lock_owner: String,
    pub scope: JobExecutionScope,
    pub async_job_lock_time: Duration,
    pub timer_lock_time: Duration,
    pub max_timer_jobs_per_acquisition: usize,
    pub include_history: bool,
    pub reset_expired_page_size: usize,
    pub reset_expired_max_timeout: Duration,
}

impl AcquisitionConfig {
    pub fn from_settings(settings: &ExecutorSettings, lock_owner: impl Into<String>) -> Self {
        Self {
            lock_owner: lock_owner.into(),
            scope: settings.job_execution_scope(),
            async_job_lock_time: Duration::from_millis(settings.async_job_lock_time_ms),
            timer_lock_time: Duration::from_millis(settings.timer_lock_time_ms),
            max_timer_jobs_per_acquisition: settings.max_timer_jobs_per_acquisition,
            include_history: settings.async_history_enabled,
            reset_expired_page_size: settings.reset_expired_jobs_page_size,
            reset_expired_max_timeout: Duration::from_millis(
                settings.reset_expired_jobs_max_timeout_ms,
            ),
        }
    }

    fn executable_states(&self) -> Vec<JobState> {
        if self.include_history {
            vec![JobState::Ready, JobState::History]
        } else {
            vec![JobState::Ready]
        }
    }
}

/// Result of one timer promotion cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerCycle {
    /// Due timers seen by the query
    pub found: usize,
    /// Timers this executor moved to READY
    pub promoted: usize,
}

#[derive(Debug, Clone)]
pub struct AcquisitionEngine {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    config: AcquisitionConfig,
}

impl AcquisitionEngine {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn lock_owner(&self) -> &str {
        &self.config.lock_owner
    }

    /// Move due timers to READY.
    ///
    /// Timers are first claimed with the timer lock so concurrent executors
    /// split the batch, then promoted one by one. A promotion that matches no
    /// row means someone else already did it.
    #[instrument(skip(self), fields(lock_owner = %self.config.lock_owner))]
    pub async fn promote_due_timers(&self) -> AppResult<TimerCycle> {
        let now = self.clock.now();
        let due = self
            .repository
            .find_due_timer_jobs(
                &self.config.scope,
                now,
                self.config.max_timer_jobs_per_acquisition,
            )
            .await?;
        if due.is_empty() {
            return Ok(TimerCycle::default());
        }

        let ids: Vec<String> = due.iter().map(|job| job.id.clone()).collect();
        let claimed = self
            .repository
            .bulk_update_job_lock(
                &ids,
                &[JobState::Timer],
                &self.config.lock_owner,
                clock::plus(now, self.config.timer_lock_time),
                now,
            )
            .await?;

        let mut promoted = 0;
        for id in &claimed {
            if self
                .repository
                .promote_timer_job(id, Some(&self.config.lock_owner), now)
                .await?
            {
                debug!(job.id = %id, "Promoted timer job");
                promoted += 1;
            } else {
                debug!(job.id = %id, "Timer job already promoted elsewhere");
            }
        }

        Ok(TimerCycle {
            found: due.len(),
            promoted,
        })
    }

    /// Claim up to `max_jobs` executable jobs for this executor.
    ///
    /// Returns the jobs as they look after the claim; candidates lost to a
    /// concurrent executor are dropped.
    #[instrument(skip(self), fields(lock_owner = %self.config.lock_owner))]
    pub async fn claim_async_jobs(&self, max_jobs: usize) -> AppResult<Vec<Job>> {
        if max_jobs == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let states = self.config.executable_states();
        let candidates = self
            .repository
            .find_jobs_to_execute(&states, &self.config.scope, now, max_jobs)
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.iter().map(|job| job.id.clone()).collect();
        let lock_expiration_time = clock::plus(now, self.config.async_job_lock_time);
        let claimed = self
            .repository
            .bulk_update_job_lock(
                &ids,
                &states,
                &self.config.lock_owner,
                lock_expiration_time,
                now,
            )
            .await?;

        if claimed.len() < candidates.len() {
            debug!(
                candidates = candidates.len(),
                claimed = claimed.len(),
                "Lost some claims to other executors"
            );
        }

        Ok(candidates
            .into_iter()
            .filter(|job| claimed.contains(&job.id))
            .map(|mut job| {
                job.lock_owner = Some(self.config.lock_owner.clone());
                job.lock_expiration_time = Some(lock_expiration_time);
                job.revision += 1;
                job
            })
            .collect())
    }

    /// Clear locks that expired longer ago than the configured grace period.
    /// Returns how many jobs were reset.
    #[instrument(skip(self))]
    pub async fn reset_expired_jobs(&self) -> AppResult<usize> {
        let expired_before = clock::minus(self.clock.now(), self.config.reset_expired_max_timeout);
        let expired = self
            .repository
            .find_expired_jobs(
                &self.config.scope,
                expired_before,
                self.config.reset_expired_page_size,
            )
            .await?;

        let mut reset = 0;
        for job in expired {
            if self
                .repository
                .reset_expired_job(&job.id, expired_before)
                .await?
            {
                debug!(
                    job.id = %job.id,
                    previous_owner = job.lock_owner.as_deref().unwrap_or_default(),
                    "Reset expired job lock"
                );
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::types::NewJob;
    use crate::repositories::MemoryJobRepository;
    use jiff::Timestamp;

    fn start() -> Timestamp {
        Timestamp::from_second(1_700_000_000).unwrap()
    }

    fn config(owner: &str) -> AcquisitionConfig {
        AcquisitionConfig {
            lock_owner: owner.to_string(),
            scope: JobExecutionScope::All,
            async_job_lock_time: Duration::from_secs(300),
            timer_lock_time: Duration::from_secs(3600),
            max_timer_jobs_per_acquisition: 10,
            include_history: true,
            reset_expired_page_size: 10,
            reset_expired_max_timeout: Duration::ZERO,
        }
    }

    fn engine(
        repository: &Arc<MemoryJobRepository>,
        clock: &ManualClock,
        owner: &str,
    ) -> AcquisitionEngine {
        AcquisitionEngine::new(
            repository.clone(),
            Arc::new(clock.clone()),
            config(owner),
        )
    }

    async fn seed(repository: &MemoryJobRepository, id: &str, state: JobState, new: NewJob) -> Job {
        repository
            .insert_job(new.into_job(id.to_string(), state, 3, start()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_due_timer_is_promoted_then_claimed() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        let due = clock::minus(start(), Duration::from_secs(10));
        seed(&repository, "t1", JobState::Timer, NewJob::new("noop").with_due_date(due)).await;

        let acquisition = engine(&repository, &clock, "node-a");
        let cycle = acquisition.promote_due_timers().await.unwrap();
        assert_eq!(cycle, TimerCycle { found: 1, promoted: 1 });

        let job = repository.find_job("t1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Ready);
        assert!(job.lock_owner.is_none());

        let claimed = acquisition.claim_async_jobs(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let stored = repository.find_job("t1").await.unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("node-a"));
        assert!(stored.lock_expiration_time.unwrap() > clock.now());
        assert_eq!(claimed[0], stored);
    }

    #[tokio::test]
    async fn test_future_timer_is_left_alone() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        let due = clock::plus(start(), Duration::from_secs(60));
        seed(&repository, "t1", JobState::Timer, NewJob::new("noop").with_due_date(due)).await;

        let cycle = engine(&repository, &clock, "node-a")
            .promote_due_timers()
            .await
            .unwrap();
        assert_eq!(cycle, TimerCycle::default());
        let job = repository.find_job("t1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Timer);
    }

    #[tokio::test]
    async fn test_concurrent_promotion_yields_single_ready_row() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        let due = clock::minus(start(), Duration::from_secs(1));
        seed(&repository, "t1", JobState::Timer, NewJob::new("noop").with_due_date(due)).await;

        let a = engine(&repository, &clock, "node-a");
        let b = engine(&repository, &clock, "node-b");
        let (ra, rb) = tokio::join!(a.promote_due_timers(), b.promote_due_timers());
        assert_eq!(ra.unwrap().promoted + rb.unwrap().promoted, 1);

        let ready = repository
            .count_jobs(&crate::jobs::types::JobQuery::in_state(JobState::Ready))
            .await
            .unwrap();
        assert_eq!(ready, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        seed(&repository, "j1", JobState::Ready, NewJob::new("noop")).await;

        let mut handles = Vec::new();
        for n in 0..16 {
            let acquisition = engine(&repository, &clock, &format!("node-{}", n));
            handles.push(tokio::spawn(async move {
                acquisition.claim_async_jobs(5).await.unwrap().len()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap();
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_history_jobs_follow_setting() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        seed(&repository, "h1", JobState::History, NewJob::new("history")).await;

        let mut without_history = config("node-a");
        without_history.include_history = false;
        let acquisition =
            AcquisitionEngine::new(repository.clone(), Arc::new(clock.clone()), without_history);
        assert!(acquisition.claim_async_jobs(5).await.unwrap().is_empty());

        let claimed = engine(&repository, &clock, "node-a")
            .claim_async_jobs(5)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_resets_only_stale_locks() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        seed(&repository, "stale", JobState::Ready, NewJob::new("noop")).await;
        seed(&repository, "live", JobState::Ready, NewJob::new("noop")).await;

        let now = clock.now();
        repository
            .bulk_update_job_lock(
                &["stale".to_string()],
                &[JobState::Ready],
                "crashed",
                clock::minus(now, Duration::from_secs(1)),
                now,
            )
            .await
            .unwrap();
        repository
            .bulk_update_job_lock(
                &["live".to_string()],
                &[JobState::Ready],
                "busy",
                clock::plus(now, Duration::from_secs(3600)),
                now,
            )
            .await
            .unwrap();

        let acquisition = engine(&repository, &clock, "node-a");
        assert_eq!(acquisition.reset_expired_jobs().await.unwrap(), 1);

        let stale = repository.find_job("stale").await.unwrap().unwrap();
        assert!(stale.lock_owner.is_none());
        let live = repository.find_job("live").await.unwrap().unwrap();
        assert_eq!(live.lock_owner.as_deref(), Some("busy"));

        let claimed = acquisition.claim_async_jobs(5).await.unwrap();
        assert_eq!(claimed.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec!["stale"]);
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_period() {
        let clock = ManualClock::new(start());
        let repository = Arc::new(MemoryJobRepository::new());
        seed(&repository, "j1", JobState::Ready, NewJob::new("noop")).await;
        let now = clock.now();
        repository
            .bulk_update_job_lock(
                &["j1".to_string()],
                &[JobState::Ready],
                "crashed",
                clock::minus(now, Duration::from_secs(1)),
                now,
            )
            .await
            .unwrap();

        let mut graceful = config("node-a");
        graceful.reset_expired_max_timeout = Duration::from_secs(60);
        let acquisition = AcquisitionEngine::new(repository.clone(), Arc::new(clock.clone()), graceful);
        assert_eq!(acquisition.reset_expired_jobs().await.unwrap(), 0);

        clock.advance(Duration::from_secs(120));
        assert_eq!(acquisition.reset_expired_jobs().await.unwrap(), 1);
    }
}
