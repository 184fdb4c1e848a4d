//! The async executor: timer, acquire and reset-expired loops feeding a
//! worker pool.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ExecutorSettings;
use crate::error::{AppError, AppResult};
use crate::jobs::acquisition::AcquisitionEngine;
use crate::jobs::worker_pool::WorkerPool;
use crate::repositories::JobRepository;

/// Lifecycle of an [`AsyncExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutorState::Stopped => "stopped",
            ExecutorState::Starting => "starting",
            ExecutorState::Running => "running",
            ExecutorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Loop timing derived from [`ExecutorSettings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub timer_acquire_enabled: bool,
    pub async_acquire_enabled: bool,
    pub reset_expired_enabled: bool,
    pub max_async_jobs_due_per_acquisition: usize,
    pub async_acquire_wait: Duration,
    pub timer_acquire_wait: Duration,
    pub max_acquire_wait: Duration,
    pub acquire_jitter: Duration,
    pub reset_expired_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&ExecutorSettings> for LoopSettings {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            timer_acquire_enabled: settings.timer_acquire_enabled,
            async_acquire_enabled: settings.async_acquire_enabled,
            reset_expired_enabled: settings.reset_expired_enabled,
            max_async_jobs_due_per_acquisition: settings.max_async_jobs_due_per_acquisition,
            async_acquire_wait: Duration::from_millis(settings.default_async_job_acquire_wait_time_ms),
            timer_acquire_wait: Duration::from_millis(settings.default_timer_job_acquire_wait_time_ms),
            max_acquire_wait: Duration::from_millis(settings.max_acquire_wait_time_ms),
            acquire_jitter: Duration::from_millis(settings.acquire_jitter_ms),
            reset_expired_interval: Duration::from_millis(settings.reset_expired_jobs_interval_ms),
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
        }
    }
}

/// Idle backoff for an acquire loop.
///
/// A full batch means more work is likely waiting, so the loop goes again
/// at once. A partial batch waits the default time. Empty cycles double the
/// wait up to the ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleBackoff {
    default_wait: Duration,
    max_wait: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(default_wait: Duration, max_wait: Duration) -> Self {
        let max_wait = max_wait.max(default_wait);
        Self {
            default_wait,
            max_wait,
            current: default_wait,
        }
    }

    /// Wait before the next cycle after one that acquired `acquired` of `batch`
    pub fn next_wait(&mut self, acquired: usize, batch: usize) -> Duration {
        if acquired > 0 {
            self.current = self.default_wait;
            if acquired >= batch {
                return Duration::ZERO;
            }
            return self.default_wait;
        }
        let wait = self.current;
        self.current = (self.current * 2).min(self.max_wait);
        wait
    }
}

fn jittered(wait: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if wait.is_zero() || jitter_ms == 0 {
        return wait;
    }
    wait + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

/// Sleep for `wait` unless cancelled first; returns `false` on cancellation
async fn pause(token: &CancellationToken, wait: Duration) -> bool {
    if wait.is_zero() {
        tokio::task::yield_now().await;
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

struct Shared {
    settings: LoopSettings,
    acquisition: Arc<AcquisitionEngine>,
    pool: Arc<WorkerPool>,
    repository: Arc<dyn JobRepository>,
    state: watch::Sender<ExecutorState>,
}

/// One executor node. Cloning yields another handle to the same executor.
#[derive(Clone)]
pub struct AsyncExecutor {
    shared: Arc<Shared>,
    run: Arc<Mutex<Option<Run>>>,
}

struct Run {
    token: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("lock_owner", &self.shared.acquisition.lock_owner())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AsyncExecutor {
    pub fn new(
        settings: LoopSettings,
        acquisition: Arc<AcquisitionEngine>,
        pool: Arc<WorkerPool>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        let (state, _) = watch::channel(ExecutorState::Stopped);
        Self {
            shared: Arc::new(Shared {
                settings,
                acquisition,
                pool,
                repository,
                state,
            }),
            run: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.shared.state.subscribe()
    }

    pub fn lock_owner(&self) -> &str {
        self.shared.acquisition.lock_owner()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// Spawn the enabled loops. Fails unless the executor is stopped; a
    /// stopped executor can be started again.
    pub async fn start(&self) -> AppResult<()> {
        let mut run = self.run.lock().await;
        if run.is_some() || self.state() != ExecutorState::Stopped {
            return Err(AppError::BadRequest {
                message: format!("Cannot start executor while {}", self.state()),
            });
        }

        self.shared.state.send_replace(ExecutorState::Starting);
        self.shared.pool.reopen();
        let token = CancellationToken::new();
        let settings = &self.shared.settings;
        let owner = self.lock_owner().to_string();
        let mut loops = Vec::new();

        if settings.timer_acquire_enabled {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            loops.push(tokio::spawn(
                timer_loop(shared, token).instrument(info_span!("timer_acquire", lock_owner = %owner)),
            ));
        }
        if settings.async_acquire_enabled {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            loops.push(tokio::spawn(
                async_loop(shared, token).instrument(info_span!("async_acquire", lock_owner = %owner)),
            ));
        }
        if settings.reset_expired_enabled {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            loops.push(tokio::spawn(
                reset_loop(shared, token).instrument(info_span!("reset_expired", lock_owner = %owner)),
            ));
        }

        *run = Some(Run { token, loops });
        self.shared.state.send_replace(ExecutorState::Running);
        info!(
            lock_owner = %owner,
            timer = settings.timer_acquire_enabled,
            acquire = settings.async_acquire_enabled,
            reset = settings.reset_expired_enabled,
            "Async executor started"
        );
        Ok(())
    }

    /// Stop the loops after their current iteration and wait for running
    /// jobs up to the shutdown timeout. Returns whether every job finished.
    pub async fn shutdown(&self) -> bool {
        let mut run = self.run.lock().await;
        let Some(Run { token, loops }) = run.take() else {
            return true;
        };

        self.shared.state.send_replace(ExecutorState::Stopping);
        info!(lock_owner = %self.lock_owner(), "Stopping async executor");
        token.cancel();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Executor loop terminated abnormally");
            }
        }

        let drained = self.shared.pool.drain(self.shared.settings.shutdown_timeout).await;
        if !drained {
            warn!(
                in_flight = self.shared.pool.in_flight(),
                "Shutdown timeout reached; interrupting running jobs, their locks stay until expiry"
            );
            self.shared.pool.cancel_running();
        }
        self.shared.state.send_replace(ExecutorState::Stopped);
        info!("Async executor stopped");
        drained
    }
}

async fn timer_loop(shared: Arc<Shared>, token: CancellationToken) {
    let settings = &shared.settings;
    let mut backoff = IdleBackoff::new(settings.timer_acquire_wait, settings.max_acquire_wait);
    let batch = shared.acquisition.config().max_timer_jobs_per_acquisition;

    loop {
        let wait = match shared.acquisition.promote_due_timers().await {
            Ok(cycle) => {
                if cycle.promoted > 0 {
                    debug!(found = cycle.found, promoted = cycle.promoted, "Timer cycle");
                }
                backoff.next_wait(cycle.found, batch)
            }
            Err(e) => {
                error!(error = %e, "Timer promotion cycle failed");
                backoff.next_wait(0, batch)
            }
        };
        if !pause(&token, jittered(wait, settings.acquire_jitter)).await {
            break;
        }
    }
    debug!("Timer acquire loop exited");
}

async fn async_loop(shared: Arc<Shared>, token: CancellationToken) {
    let settings = &shared.settings;
    let mut backoff = IdleBackoff::new(settings.async_acquire_wait, settings.max_acquire_wait);
    let owner = shared.acquisition.lock_owner().to_string();

    loop {
        let capacity = shared.pool.available_capacity();
        let batch = settings.max_async_jobs_due_per_acquisition.min(capacity);

        let wait = if batch == 0 {
            debug!("Worker pool saturated, skipping acquisition");
            settings.async_acquire_wait
        } else {
            match shared.acquisition.claim_async_jobs(batch).await {
                Ok(jobs) => {
                    let acquired = jobs.len();
                    for job in jobs {
                        if let Err(rejected) = shared.pool.try_submit(job) {
                            warn!(job.id = %rejected.id, "Worker pool rejected job, releasing lock");
                            if let Err(e) = shared.repository.release_job_lock(&rejected.id, &owner).await {
                                error!(job.id = %rejected.id, error = %e, "Failed to release rejected job");
                            }
                        }
                    }
                    backoff.next_wait(acquired, batch)
                }
                Err(e) => {
                    error!(error = %e, "Async acquisition cycle failed");
                    backoff.next_wait(0, batch)
                }
            }
        };
        if !pause(&token, jittered(wait, settings.acquire_jitter)).await {
            break;
        }
    }
    debug!("Async acquire loop exited");
}

async fn reset_loop(shared: Arc<Shared>, token: CancellationToken) {
    let interval = shared.settings.reset_expired_interval;
    loop {
        match shared.acquisition.reset_expired_jobs().await {
            Ok(0) => {}
            Ok(reset) => info!(reset, "Reset expired job locks"),
            Err(e) => error!(error = %e, "Expired lock sweep failed"),
        }
        if !pause(&token, interval).await {
            break;
        }
    }
    debug!("Reset expired loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut backoff = IdleBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(1));
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(2));
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(4));
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(5));
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_resets_on_work() {
        let mut backoff = IdleBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        backoff.next_wait(0, 10);
        backoff.next_wait(0, 10);
        assert_eq!(backoff.next_wait(3, 10), Duration::from_secs(1));
        assert_eq!(backoff.next_wait(10, 10), Duration::ZERO);
        assert_eq!(backoff.next_wait(0, 10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let wait = Duration::from_millis(100);
        for _ in 0..100 {
            let delayed = jittered(wait, Duration::from_millis(50));
            assert!(delayed >= wait && delayed <= Duration::from_millis(150));
        }
        assert_eq!(jittered(Duration::ZERO, Duration::from_millis(50)), Duration::ZERO);
    }

    #[test]
    fn test_loop_settings_from_executor_settings() {
        let settings = ExecutorSettings::default();
        let loops = LoopSettings::from(&settings);
        assert_eq!(
            loops.async_acquire_wait,
            Duration::from_millis(settings.default_async_job_acquire_wait_time_ms)
        );
        assert_eq!(loops.max_async_jobs_due_per_acquisition, settings.max_async_jobs_due_per_acquisition);
        assert!(loops.timer_acquire_enabled && loops.async_acquire_enabled);
    }
}
