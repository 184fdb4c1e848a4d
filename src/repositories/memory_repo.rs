//! In-process [`JobRepository`] for embedding and tests.
//!
//! All state sits behind one mutex, so every operation (including the
//! multi-row completion) is atomic with respect to every other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use jiff::Timestamp;

use crate::error::{AppError, AppResult};
use crate::jobs::types::{
    CompletionEffects, ExternalJobAcquisition, ExternalJobFailure, Job,
    JobExecutionScope, JobFailure, JobQuery, JobState, Variable,
};
use crate::repositories::{JobMove, JobRepository, apply_failure, check_external_owner};

#[derive(Debug, Default)]
struct MemoryStore {
    jobs: HashMap<String, Job>,
    /// scope id -> variable name -> (scope type, variable)
    variables: HashMap<String, BTreeMap<String, (Option<String>, Variable)>>,
}

impl MemoryStore {
    fn sorted<'a>(&'a self, filter: impl Fn(&Job) -> bool) -> Vec<&'a Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|job| filter(job)).collect();
        jobs.sort_by(|a, b| a.create_time.cmp(&b.create_time).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    fn check_unique(&self, job: &Job) -> AppResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(AppError::Duplicate {
                entity: "Job".to_string(),
                field: "id".to_string(),
                value: job.id.clone(),
            });
        }
        if let Some(correlation_id) = &job.correlation_id {
            let taken = self
                .jobs
                .values()
                .any(|existing| existing.correlation_id.as_ref() == Some(correlation_id));
            if taken {
                return Err(AppError::Duplicate {
                    entity: "Job".to_string(),
                    field: "correlation_id".to_string(),
                    value: correlation_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn write_variables(&mut self, scope_id: &str, scope_type: Option<&str>, variables: &[Variable]) {
        let scope = self.variables.entry(scope_id.to_string()).or_default();
        for variable in variables {
            scope.insert(
                variable.name.clone(),
                (scope_type.map(str::to_string), variable.clone()),
            );
        }
    }

    fn external_job_mut(&mut self, id: &str, worker_id: &str) -> AppResult<&mut Job> {
        check_external_owner(self.jobs.get(id), id, worker_id)?;
        self.jobs
            .get_mut(id)
            .ok_or_else(|| AppError::job_not_found(id))
    }
}

fn in_scope(scope_id: &str, sub_scope_id: Option<&str>) -> impl Fn(&Job) -> bool {
    move |job: &Job| {
        job.scope_id.as_deref() == Some(scope_id)
            && sub_scope_id.is_none_or(|sub| job.sub_scope_id.as_deref() == Some(sub))
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    store: Mutex<MemoryStore>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> AppResult<MutexGuard<'_, MemoryStore>> {
        self.store.lock().map_err(|_| AppError::Internal {
            source: anyhow::anyhow!("in-memory job store mutex poisoned"),
        })
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert_job(&self, job: Job) -> AppResult<Job> {
        let mut store = self.store()?;
        store.check_unique(&job)?;
        store.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: &str) -> AppResult<Option<Job>> {
        Ok(self.store()?.jobs.get(id).cloned())
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> AppResult<Option<Job>> {
        Ok(self
            .store()?
            .jobs
            .values()
            .find(|job| job.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn update_job(&self, job: &Job) -> AppResult<Job> {
        let mut store = self.store()?;
        let stored = store
            .jobs
            .get_mut(&job.id)
            .filter(|stored| stored.revision == job.revision)
            .ok_or_else(|| AppError::OptimisticLock {
                entity: "Job".to_string(),
                id: job.id.clone(),
            })?;
        *stored = job.clone();
        stored.revision += 1;
        Ok(stored.clone())
    }

    async fn delete_job(&self, id: &str) -> AppResult<bool> {
        Ok(self.store()?.jobs.remove(id).is_some())
    }

    async fn query_jobs(&self, query: &JobQuery) -> AppResult<Vec<Job>> {
        let store = self.store()?;
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(store
            .sorted(|job| query.matches(job))
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_jobs(&self, query: &JobQuery) -> AppResult<i64> {
        let store = self.store()?;
        Ok(store.jobs.values().filter(|job| query.matches(job)).count() as i64)
    }

    async fn find_jobs_to_execute(
        &self,
        states: &[JobState],
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let store = self.store()?;
        Ok(store
            .sorted(|job| {
                states.contains(&job.state)
                    && job.is_claimable_at(now)
                    && job.is_due_at(now)
                    && scope.matches(job.scope_type.as_deref())
            })
            .into_iter()
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn bulk_update_job_lock(
        &self,
        ids: &[String],
        states: &[JobState],
        lock_owner: &str,
        lock_expiration_time: Timestamp,
        now: Timestamp,
    ) -> AppResult<Vec<String>> {
        let mut store = self.store()?;
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = store.jobs.get_mut(id) {
                if states.contains(&job.state) && job.is_claimable_at(now) {
                    job.lock_owner = Some(lock_owner.to_string());
                    job.lock_expiration_time = Some(lock_expiration_time);
                    job.revision += 1;
                    claimed.push(id.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn find_due_timer_jobs(
        &self,
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let store = self.store()?;
        let mut due: Vec<&Job> = store
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Timer
                    && job.due_date.is_some_and(|due| due <= now)
                    && job.is_claimable_at(now)
                    && scope.matches(job.scope_type.as_deref())
            })
            .collect();
        due.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        Ok(due.into_iter().take(max_results).cloned().collect())
    }

    async fn promote_timer_job(
        &self,
        id: &str,
        lock_owner: Option<&str>,
        now: Timestamp,
    ) -> AppResult<bool> {
        let mut store = self.store()?;
        let Some(job) = store.jobs.get_mut(id) else {
            return Ok(false);
        };
        let held = lock_owner.is_some_and(|owner| job.is_locked_by(owner));
        let eligible = job.state == JobState::Timer
            && job.due_date.is_some_and(|due| due <= now)
            && (held || job.is_claimable_at(now));
        if !eligible {
            return Ok(false);
        }
        job.state = JobState::Ready;
        job.clear_lock();
        job.revision += 1;
        Ok(true)
    }

    async fn find_expired_jobs(
        &self,
        scope: &JobExecutionScope,
        expired_before: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let store = self.store()?;
        Ok(store
            .sorted(|job| {
                job.lock_expiration_time
                    .is_some_and(|expiration| expiration < expired_before)
                    && scope.matches(job.scope_type.as_deref())
            })
            .into_iter()
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn reset_expired_job(&self, id: &str, expired_before: Timestamp) -> AppResult<bool> {
        let mut store = self.store()?;
        match store.jobs.get_mut(id) {
            Some(job)
                if job
                    .lock_expiration_time
                    .is_some_and(|expiration| expiration < expired_before) =>
            {
                job.clear_lock();
                job.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_job_lock(&self, id: &str, lock_owner: &str) -> AppResult<bool> {
        let mut store = self.store()?;
        match store.jobs.get_mut(id) {
            Some(job) if job.is_locked_by(lock_owner) => {
                job.clear_lock();
                job.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(
        &self,
        id: &str,
        lock_owner: &str,
        effects: CompletionEffects,
    ) -> AppResult<bool> {
        let mut store = self.store()?;
        let held = store
            .jobs
            .get(id)
            .is_some_and(|job| job.state.is_executable() && job.is_locked_by(lock_owner));
        if !held {
            return Ok(false);
        }

        for job in &effects.new_jobs {
            store.check_unique(job)?;
        }

        store.jobs.remove(id);
        for job in effects.new_jobs {
            store.jobs.insert(job.id.clone(), job);
        }
        for write in &effects.variables {
            store.write_variables(&write.scope_id, write.scope_type.as_deref(), &write.variables);
        }
        Ok(true)
    }

    async fn fail_job(&self, failure: JobFailure) -> AppResult<bool> {
        let mut store = self.store()?;
        match store.jobs.get_mut(&failure.job_id) {
            Some(job) if job.state.is_executable() && job.is_locked_by(&failure.lock_owner) => {
                apply_failure(
                    job,
                    &failure.target,
                    Some(failure.exception_message),
                    failure.exception_stacktrace,
                    failure.failed_at,
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn move_job(&self, id: &str, job_move: &JobMove) -> AppResult<Option<Job>> {
        let mut store = self.store()?;
        match store.jobs.get_mut(id) {
            Some(job) if job_move.from.contains(&job.state) => {
                job_move.apply(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_jobs_by_scope(
        &self,
        scope_id: &str,
        sub_scope_id: Option<&str>,
    ) -> AppResult<Vec<Job>> {
        let store = self.store()?;
        Ok(store
            .sorted(in_scope(scope_id, sub_scope_id))
            .into_iter()
            .cloned()
            .collect())
    }

    async fn delete_jobs_by_scope(
        &self,
        scope_id: &str,
        sub_scope_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut store = self.store()?;
        let matches = in_scope(scope_id, sub_scope_id);
        let before = store.jobs.len();
        store.jobs.retain(|_, job| !matches(&*job));
        Ok((before - store.jobs.len()) as u64)
    }

    async fn update_tenant_for_deployment(
        &self,
        deployment_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut store = self.store()?;
        let mut updated = 0;
        for job in store.jobs.values_mut() {
            if job.deployment_id.as_deref() == Some(deployment_id) {
                job.tenant_id = tenant_id.map(str::to_string);
                job.revision += 1;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_dead_letter_jobs_before(
        &self,
        cutoff: Timestamp,
        max_results: usize,
    ) -> AppResult<u64> {
        let mut store = self.store()?;
        let mut expired = store.sorted(|job| {
            job.state == JobState::DeadLetter
                && job.dead_letter_time.is_some_and(|time| time < cutoff)
        });
        expired.sort_by_key(|job| job.dead_letter_time);
        let doomed: Vec<String> = expired
            .into_iter()
            .take(max_results)
            .map(|job| job.id.clone())
            .collect();
        for id in &doomed {
            store.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn acquire_external_jobs(
        &self,
        acquisition: &ExternalJobAcquisition,
        now: Timestamp,
    ) -> AppResult<Vec<Job>> {
        let mut store = self.store()?;
        let ids: Vec<String> = store
            .sorted(|job| acquisition.accepts(job, now))
            .into_iter()
            .take(acquisition.number_of_tasks)
            .map(|job| job.id.clone())
            .collect();

        let mut acquired = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = store.jobs.get_mut(&id) {
                job.lock_owner = Some(acquisition.worker_id.clone());
                job.lock_expiration_time = Some(acquisition.lock_expiration_time);
                job.revision += 1;
                acquired.push(job.clone());
            }
        }
        Ok(acquired)
    }

    async fn complete_external_job(
        &self,
        id: &str,
        worker_id: &str,
        continuation_handler_type: &str,
        variables: &[Variable],
    ) -> AppResult<Job> {
        let mut store = self.store()?;
        let job = store.external_job_mut(id, worker_id)?;
        job.state = JobState::Ready;
        job.handler_type = continuation_handler_type.to_string();
        job.due_date = None;
        job.clear_lock();
        job.revision += 1;
        let completed = job.clone();

        let (scope_id, scope_type) = completed.variable_scope();
        store.write_variables(&scope_id, scope_type.as_deref(), variables);
        Ok(completed)
    }

    async fn fail_external_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &ExternalJobFailure,
        now: Timestamp,
    ) -> AppResult<Job> {
        let mut store = self.store()?;
        let job = store.external_job_mut(id, worker_id)?;
        let target = failure.target_for(job, now);
        apply_failure(
            job,
            &target,
            failure.error_message.clone(),
            failure.error_details.clone(),
            now,
        );
        Ok(job.clone())
    }

    async fn unacquire_external_job(&self, id: &str, worker_id: &str) -> AppResult<Job> {
        let mut store = self.store()?;
        let job = store.external_job_mut(id, worker_id)?;
        job.clear_lock();
        job.revision += 1;
        Ok(job.clone())
    }

    async fn unacquire_all_external_jobs(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut store = self.store()?;
        let mut released = 0;
        for job in store.jobs.values_mut() {
            let matches = job.state == JobState::ExternalWorker
                && job.is_locked_by(worker_id)
                && tenant_id.is_none_or(|tenant| job.tenant_id.as_deref() == Some(tenant));
            if matches {
                job.clear_lock();
                job.revision += 1;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn extend_external_job_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_expiration_time: Timestamp,
    ) -> AppResult<Job> {
        let mut store = self.store()?;
        let job = store.external_job_mut(id, worker_id)?;
        job.lock_expiration_time = Some(lock_expiration_time);
        job.revision += 1;
        Ok(job.clone())
    }

    async fn scope_variables(&self, scope_id: &str) -> AppResult<Vec<Variable>> {
        let store = self.store()?;
        Ok(store
            .variables
            .get(scope_id)
            .map(|scope| scope.values().map(|(_, variable)| variable.clone()).collect())
            .unwrap_or_default())
    }
}
