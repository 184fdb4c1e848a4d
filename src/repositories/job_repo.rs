//! PostgreSQL [`JobRepository`] on diesel-async.
//!
//! The claim, promotion, reset and release paths are single conditional
//! `UPDATE`s whose affected rows decide who won. Everything else locks the
//! row with `SELECT ... FOR UPDATE` inside a transaction, applies the same
//! domain mutation the in-memory repository uses, and writes the row back.

use std::collections::HashMap;

use async_trait::async_trait;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::bb8::PooledConnection;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use jiff::Timestamp;
use jiff_diesel::ToDiesel;

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult};
use crate::id::{IdGenerator, UuidIdGenerator};
use crate::jobs::models::{
    JobRecord, JobRow, MAX_INLINE_CONFIGURATION, NewByteArray, NewScopeVariable, ScopeVariableRow,
};
use crate::jobs::types::{
    CompletionEffects, ExternalJobAcquisition, ExternalJobFailure, Job, JobExecutionScope,
    JobFailure, JobQuery, JobState, Variable,
};
use crate::repositories::{JobMove, JobRepository, apply_failure, check_external_owner};
use crate::schema::{lockstep_byte_arrays, lockstep_jobs, lockstep_scope_variables};

type BoxedJobQuery = lockstep_jobs::BoxedQuery<'static, Pg>;

const EXECUTABLE_STATES: [JobState; 2] = [JobState::Ready, JobState::History];

#[derive(Clone)]
pub struct PgJobRepository {
    pool: AsyncDbPool,
    ids: UuidIdGenerator,
}

impl std::fmt::Debug for PgJobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobRepository").finish_non_exhaustive()
    }
}

impl PgJobRepository {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self {
            pool,
            ids: UuidIdGenerator,
        }
    }

    async fn conn(&self) -> AppResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool.get().await.map_err(|e| AppError::ConnectionPool {
            source: anyhow::Error::from(e),
        })
    }
}

// ============================================================================
// Query building
// ============================================================================

fn scoped(query: BoxedJobQuery, scope: &JobExecutionScope) -> BoxedJobQuery {
    match scope {
        JobExecutionScope::All => query,
        JobExecutionScope::Unscoped => query.filter(lockstep_jobs::scope_type.is_null()),
        JobExecutionScope::ScopeType(scope_type) => {
            query.filter(lockstep_jobs::scope_type.eq(scope_type.clone()))
        }
    }
}

fn claimable(query: BoxedJobQuery, now: Timestamp) -> BoxedJobQuery {
    query.filter(
        lockstep_jobs::lock_owner
            .is_null()
            .or(lockstep_jobs::lock_expiration_time.lt(now.to_diesel())),
    )
}

fn due(query: BoxedJobQuery, now: Timestamp) -> BoxedJobQuery {
    query.filter(
        lockstep_jobs::due_date
            .is_null()
            .or(lockstep_jobs::due_date.le(now.to_diesel())),
    )
}

fn filtered(query: &JobQuery) -> BoxedJobQuery {
    let mut boxed = lockstep_jobs::table.into_boxed();

    if !query.states.is_empty() {
        boxed = boxed.filter(lockstep_jobs::state.eq_any(query.states.clone()));
    }
    if let Some(handler_type) = &query.handler_type {
        boxed = boxed.filter(lockstep_jobs::handler_type.eq(handler_type.clone()));
    }
    if let Some(tenant_id) = &query.tenant_id {
        boxed = boxed.filter(lockstep_jobs::tenant_id.eq(tenant_id.clone()));
    }
    if let Some(scope_id) = &query.scope_id {
        boxed = boxed.filter(lockstep_jobs::scope_id.eq(scope_id.clone()));
    }
    if let Some(sub_scope_id) = &query.sub_scope_id {
        boxed = boxed.filter(lockstep_jobs::sub_scope_id.eq(sub_scope_id.clone()));
    }
    if let Some(scope_type) = &query.scope_type {
        boxed = boxed.filter(lockstep_jobs::scope_type.eq(scope_type.clone()));
    }
    if let Some(correlation_id) = &query.correlation_id {
        boxed = boxed.filter(lockstep_jobs::correlation_id.eq(correlation_id.clone()));
    }
    if let Some(lock_owner) = &query.lock_owner {
        boxed = boxed.filter(lockstep_jobs::lock_owner.eq(lock_owner.clone()));
    }
    if let Some(before) = query.due_before {
        boxed = boxed.filter(lockstep_jobs::due_date.lt(before.to_diesel()));
    }
    if let Some(after) = query.due_after {
        boxed = boxed.filter(lockstep_jobs::due_date.gt(after.to_diesel()));
    }
    if query.with_exception {
        boxed = boxed.filter(lockstep_jobs::exception_message.is_not_null());
    }
    boxed
}

fn in_scope(scope_id: &str, sub_scope_id: Option<&str>) -> BoxedJobQuery {
    let mut boxed = lockstep_jobs::table
        .into_boxed()
        .filter(lockstep_jobs::scope_id.eq(scope_id.to_string()));
    if let Some(sub_scope_id) = sub_scope_id {
        boxed = boxed.filter(lockstep_jobs::sub_scope_id.eq(sub_scope_id.to_string()));
    }
    boxed
}

// ============================================================================
// Row helpers shared by the transactional paths
// ============================================================================

async fn load_rows(conn: &mut AsyncPgConnection, query: BoxedJobQuery) -> AppResult<Vec<Job>> {
    let rows: Vec<JobRow> = query
        .select(JobRow::as_select())
        .load(conn)
        .await
        .map_err(AppError::from)?;
    hydrate(conn, rows).await
}

/// Resolve out-of-line payloads and convert rows to jobs
async fn hydrate(conn: &mut AsyncPgConnection, rows: Vec<JobRow>) -> AppResult<Vec<Job>> {
    let refs: Vec<String> = rows.iter().flat_map(|r| r.byte_array_refs().cloned()).collect();

    let payloads: HashMap<String, String> = if refs.is_empty() {
        HashMap::new()
    } else {
        lockstep_byte_arrays::table
            .filter(lockstep_byte_arrays::id.eq_any(refs))
            .select((lockstep_byte_arrays::id, lockstep_byte_arrays::bytes))
            .load::<(String, Vec<u8>)>(conn)
            .await
            .map_err(AppError::from)?
            .into_iter()
            .map(|(id, bytes)| (id, String::from_utf8_lossy(&bytes).into_owned()))
            .collect()
    };

    Ok(rows
        .into_iter()
        .map(|row| {
            let configuration = row
                .configuration_ref
                .as_ref()
                .and_then(|r| payloads.get(r).cloned());
            let stacktrace = row
                .exception_ref
                .as_ref()
                .and_then(|r| payloads.get(r).cloned());
            row.into_job(configuration, stacktrace)
        })
        .collect())
}

async fn lock_row(conn: &mut AsyncPgConnection, id: &str) -> AppResult<Option<JobRow>> {
    lockstep_jobs::table
        .find(id)
        .select(JobRow::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()
        .map_err(AppError::from)
}

async fn lock_job(conn: &mut AsyncPgConnection, id: &str) -> AppResult<Option<(JobRow, Job)>> {
    let Some(row) = lock_row(conn, id).await? else {
        return Ok(None);
    };
    let job = hydrate(conn, vec![row.clone()])
        .await?
        .pop()
        .ok_or_else(|| AppError::job_not_found(id))?;
    Ok(Some((row, job)))
}

async fn insert_byte_array(
    conn: &mut AsyncPgConnection,
    id: String,
    name: &str,
    content: &str,
) -> AppResult<String> {
    diesel::insert_into(lockstep_byte_arrays::table)
        .values(&NewByteArray {
            id: id.clone(),
            name: name.to_string(),
            bytes: content.as_bytes().to_vec(),
        })
        .execute(conn)
        .await
        .map_err(AppError::from)?;
    Ok(id)
}

async fn delete_byte_arrays(conn: &mut AsyncPgConnection, ids: Vec<String>) -> AppResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    diesel::delete(lockstep_byte_arrays::table.filter(lockstep_byte_arrays::id.eq_any(ids)))
        .execute(conn)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

impl PgJobRepository {
    /// Build the row image of `job`, writing large payloads out of line.
    /// `previous` lets unchanged payloads keep their existing storage.
    async fn record_for(
        &self,
        conn: &mut AsyncPgConnection,
        job: &Job,
        previous: Option<(&JobRow, &Job)>,
    ) -> AppResult<JobRecord> {
        let mut record = JobRecord::from_job(job);

        match previous {
            Some((row, before)) if before.handler_configuration == job.handler_configuration => {
                record.handler_configuration = row.handler_configuration.clone();
                record.configuration_ref = row.configuration_ref.clone();
            }
            _ => match job.handler_configuration.as_deref() {
                Some(configuration) if configuration.chars().count() > MAX_INLINE_CONFIGURATION => {
                    let id = self.ids.next_id();
                    record.configuration_ref =
                        Some(insert_byte_array(conn, id, "job-configuration", configuration).await?);
                }
                other => record.handler_configuration = other.map(str::to_string),
            },
        }

        match previous {
            Some((row, before)) if before.exception_stacktrace == job.exception_stacktrace => {
                record.exception_ref = row.exception_ref.clone();
            }
            _ => {
                if let Some(stacktrace) = job.exception_stacktrace.as_deref() {
                    let id = self.ids.next_id();
                    record.exception_ref =
                        Some(insert_byte_array(conn, id, "job-exception", stacktrace).await?);
                }
            }
        }

        Ok(record)
    }

    async fn insert_in(&self, conn: &mut AsyncPgConnection, job: &Job) -> AppResult<()> {
        let record = self.record_for(conn, job, None).await?;
        diesel::insert_into(lockstep_jobs::table)
            .values(&record)
            .execute(conn)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    /// Write back a job locked with [`lock_job`] and drop replaced payloads
    async fn store_in(
        &self,
        conn: &mut AsyncPgConnection,
        row: &JobRow,
        before: &Job,
        job: &Job,
    ) -> AppResult<()> {
        let record = self.record_for(conn, job, Some((row, before))).await?;
        diesel::update(lockstep_jobs::table.find(&row.id))
            .set(&record)
            .execute(conn)
            .await
            .map_err(AppError::from)?;

        let replaced: Vec<String> = [
            (&row.configuration_ref, &record.configuration_ref),
            (&row.exception_ref, &record.exception_ref),
        ]
        .into_iter()
        .filter_map(|(old, new)| match old {
            Some(old) if Some(old) != new.as_ref() => Some(old.clone()),
            _ => None,
        })
        .collect();
        delete_byte_arrays(conn, replaced).await
    }

    async fn write_variables(
        conn: &mut AsyncPgConnection,
        scope_id: &str,
        scope_type: Option<&str>,
        variables: &[Variable],
    ) -> AppResult<()> {
        for variable in variables {
            diesel::insert_into(lockstep_scope_variables::table)
                .values(&NewScopeVariable::new(scope_id, scope_type, variable))
                .on_conflict((
                    lockstep_scope_variables::scope_id,
                    lockstep_scope_variables::name,
                ))
                .do_update()
                .set((
                    lockstep_scope_variables::scope_type.eq(excluded(lockstep_scope_variables::scope_type)),
                    lockstep_scope_variables::var_type.eq(excluded(lockstep_scope_variables::var_type)),
                    lockstep_scope_variables::value.eq(excluded(lockstep_scope_variables::value)),
                    lockstep_scope_variables::update_time.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await
                .map_err(AppError::from)?;
        }
        Ok(())
    }

    /// Delete rows matched by `query` together with their payloads
    async fn delete_where(conn: &mut AsyncPgConnection, query: BoxedJobQuery) -> AppResult<u64> {
        let rows: Vec<JobRow> = query
            .select(JobRow::as_select())
            .load(conn)
            .await
            .map_err(AppError::from)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let refs: Vec<String> = rows.iter().flat_map(|r| r.byte_array_refs().cloned()).collect();

        let deleted = diesel::delete(lockstep_jobs::table.filter(lockstep_jobs::id.eq_any(ids)))
            .execute(conn)
            .await
            .map_err(AppError::from)?;
        delete_byte_arrays(conn, refs).await?;
        Ok(deleted as u64)
    }

    /// Lock an external job, enforce ownership, mutate and write it back
    async fn update_external<F>(&self, id: &str, worker_id: &str, mutate: F) -> AppResult<Job>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let locked = lock_job(conn, id).await?;
                check_external_owner(locked.as_ref().map(|(_, job)| job), id, worker_id)?;
                let Some((row, before)) = locked else {
                    return Err(AppError::job_not_found(id));
                };

                let mut job = before.clone();
                mutate(&mut job);
                self.store_in(conn, &row, &before, &job).await?;
                Ok(job)
            }
            .scope_boxed()
        })
        .await
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert_job(&self, job: Job) -> AppResult<Job> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                self.insert_in(conn, &job).await?;
                Ok(job)
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_job(&self, id: &str) -> AppResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::id.eq(id.to_string()));
        Ok(load_rows(&mut conn, query).await?.pop())
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> AppResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::correlation_id.eq(correlation_id.to_string()));
        Ok(load_rows(&mut conn, query).await?.pop())
    }

    async fn update_job(&self, job: &Job) -> AppResult<Job> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let lost = || AppError::OptimisticLock {
                    entity: "Job".to_string(),
                    id: job.id.clone(),
                };
                let (row, before) = lock_job(conn, &job.id).await?.ok_or_else(lost)?;
                if row.revision != job.revision {
                    return Err(lost());
                }

                let mut updated = job.clone();
                updated.revision += 1;
                self.store_in(conn, &row, &before, &updated).await?;
                Ok(updated)
            }
            .scope_boxed()
        })
        .await
    }

    async fn delete_job(&self, id: &str) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let query = lockstep_jobs::table
                    .into_boxed()
                    .filter(lockstep_jobs::id.eq(id.to_string()));
                Ok(Self::delete_where(conn, query).await? > 0)
            }
            .scope_boxed()
        })
        .await
    }

    async fn query_jobs(&self, query: &JobQuery) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let mut boxed = filtered(query)
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()));
        if let Some(limit) = query.limit {
            boxed = boxed.limit(limit);
        }
        if let Some(offset) = query.offset {
            boxed = boxed.offset(offset);
        }
        load_rows(&mut conn, boxed).await
    }

    async fn count_jobs(&self, query: &JobQuery) -> AppResult<i64> {
        let mut conn = self.conn().await?;
        filtered(query)
            .count()
            .get_result(&mut conn)
            .await
            .map_err(AppError::from)
    }

    async fn find_jobs_to_execute(
        &self,
        states: &[JobState],
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::state.eq_any(states.to_vec()));
        let query = due(claimable(scoped(query, scope), now), now)
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()))
            .limit(max_results as i64);
        load_rows(&mut conn, query).await
    }

    async fn bulk_update_job_lock(
        &self,
        ids: &[String],
        states: &[JobState],
        lock_owner: &str,
        lock_expiration_time: Timestamp,
        now: Timestamp,
    ) -> AppResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        // The WHERE clause is the mutual-exclusion point: of any number of
        // concurrent claimers, only one sees the row as claimable.
        diesel::update(
            lockstep_jobs::table
                .filter(lockstep_jobs::id.eq_any(ids.to_vec()))
                .filter(lockstep_jobs::state.eq_any(states.to_vec()))
                .filter(
                    lockstep_jobs::lock_owner
                        .is_null()
                        .or(lockstep_jobs::lock_expiration_time.lt(now.to_diesel())),
                ),
        )
        .set((
            lockstep_jobs::lock_owner.eq(lock_owner),
            lockstep_jobs::lock_expiration_time.eq(lock_expiration_time.to_diesel()),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .returning(lockstep_jobs::id)
        .get_results(&mut conn)
        .await
        .map_err(AppError::from)
    }

    async fn find_due_timer_jobs(
        &self,
        scope: &JobExecutionScope,
        now: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::state.eq(JobState::Timer))
            .filter(lockstep_jobs::due_date.le(now.to_diesel()));
        let query = claimable(scoped(query, scope), now)
            .order((lockstep_jobs::due_date.asc(), lockstep_jobs::id.asc()))
            .limit(max_results as i64);
        load_rows(&mut conn, query).await
    }

    async fn promote_timer_job(
        &self,
        id: &str,
        lock_owner: Option<&str>,
        now: Timestamp,
    ) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        let held_or_free = lockstep_jobs::lock_owner
            .is_null()
            .or(lockstep_jobs::lock_expiration_time.lt(now.to_diesel()))
            .or(lockstep_jobs::lock_owner.eq(lock_owner.unwrap_or_default().to_string()));

        let promoted = diesel::update(
            lockstep_jobs::table
                .filter(lockstep_jobs::id.eq(id))
                .filter(lockstep_jobs::state.eq(JobState::Timer))
                .filter(lockstep_jobs::due_date.le(now.to_diesel()))
                .filter(held_or_free),
        )
        .set((
            lockstep_jobs::state.eq(JobState::Ready),
            lockstep_jobs::lock_owner.eq(None::<String>),
            lockstep_jobs::lock_expiration_time.eq(None::<jiff_diesel::Timestamp>),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
        Ok(promoted == 1)
    }

    async fn find_expired_jobs(
        &self,
        scope: &JobExecutionScope,
        expired_before: Timestamp,
        max_results: usize,
    ) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::lock_expiration_time.lt(expired_before.to_diesel()));
        let query = scoped(query, scope)
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()))
            .limit(max_results as i64);
        load_rows(&mut conn, query).await
    }

    async fn reset_expired_job(&self, id: &str, expired_before: Timestamp) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        let reset = diesel::update(
            lockstep_jobs::table
                .filter(lockstep_jobs::id.eq(id))
                .filter(lockstep_jobs::lock_expiration_time.lt(expired_before.to_diesel())),
        )
        .set((
            lockstep_jobs::lock_owner.eq(None::<String>),
            lockstep_jobs::lock_expiration_time.eq(None::<jiff_diesel::Timestamp>),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
        Ok(reset == 1)
    }

    async fn release_job_lock(&self, id: &str, lock_owner: &str) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        let released = diesel::update(
            lockstep_jobs::table
                .filter(lockstep_jobs::id.eq(id))
                .filter(lockstep_jobs::lock_owner.eq(lock_owner)),
        )
        .set((
            lockstep_jobs::lock_owner.eq(None::<String>),
            lockstep_jobs::lock_expiration_time.eq(None::<jiff_diesel::Timestamp>),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
        Ok(released == 1)
    }

    async fn complete_job(
        &self,
        id: &str,
        lock_owner: &str,
        effects: CompletionEffects,
    ) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let held = lock_row(conn, id).await?.filter(|row| {
                    row.state.is_executable() && row.lock_owner.as_deref() == Some(lock_owner)
                });
                if held.is_none() {
                    return Ok(false);
                }

                let query = lockstep_jobs::table
                    .into_boxed()
                    .filter(lockstep_jobs::id.eq(id.to_string()));
                Self::delete_where(conn, query).await?;

                for job in &effects.new_jobs {
                    self.insert_in(conn, job).await?;
                }
                for write in &effects.variables {
                    Self::write_variables(
                        conn,
                        &write.scope_id,
                        write.scope_type.as_deref(),
                        &write.variables,
                    )
                    .await?;
                }
                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn fail_job(&self, failure: JobFailure) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let Some((row, before)) = lock_job(conn, &failure.job_id).await? else {
                    return Ok(false);
                };
                if !before.state.is_executable() || !before.is_locked_by(&failure.lock_owner) {
                    return Ok(false);
                }

                let mut job = before.clone();
                apply_failure(
                    &mut job,
                    &failure.target,
                    Some(failure.exception_message.clone()),
                    failure.exception_stacktrace.clone(),
                    failure.failed_at,
                );
                self.store_in(conn, &row, &before, &job).await?;
                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn move_job(&self, id: &str, job_move: &JobMove) -> AppResult<Option<Job>> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let Some((row, before)) = lock_job(conn, id).await? else {
                    return Ok(None);
                };
                if !job_move.from.contains(&before.state) {
                    return Ok(None);
                }

                let mut job = before.clone();
                job_move.apply(&mut job);
                self.store_in(conn, &row, &before, &job).await?;
                Ok(Some(job))
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_jobs_by_scope(
        &self,
        scope_id: &str,
        sub_scope_id: Option<&str>,
    ) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let query = in_scope(scope_id, sub_scope_id)
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()));
        load_rows(&mut conn, query).await
    }

    async fn delete_jobs_by_scope(
        &self,
        scope_id: &str,
        sub_scope_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move { Self::delete_where(conn, in_scope(scope_id, sub_scope_id)).await }
                .scope_boxed()
        })
        .await
    }

    async fn update_tenant_for_deployment(
        &self,
        deployment_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            lockstep_jobs::table.filter(lockstep_jobs::deployment_id.eq(deployment_id)),
        )
        .set((
            lockstep_jobs::tenant_id.eq(tenant_id),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
        Ok(updated as u64)
    }

    async fn delete_dead_letter_jobs_before(
        &self,
        cutoff: Timestamp,
        max_results: usize,
    ) -> AppResult<u64> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let query = lockstep_jobs::table
                    .into_boxed()
                    .filter(lockstep_jobs::state.eq(JobState::DeadLetter))
                    .filter(lockstep_jobs::dead_letter_time.lt(cutoff.to_diesel()))
                    .order(lockstep_jobs::dead_letter_time.asc())
                    .limit(max_results as i64);
                Self::delete_where(conn, query).await
            }
            .scope_boxed()
        })
        .await
    }

    async fn acquire_external_jobs(
        &self,
        acquisition: &ExternalJobAcquisition,
        now: Timestamp,
    ) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;

        let mut query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::state.eq(JobState::ExternalWorker))
            .filter(lockstep_jobs::handler_configuration.eq(acquisition.topic.clone()))
            .filter(
                lockstep_jobs::due_date
                    .is_null()
                    .or(lockstep_jobs::due_date.le(now.to_diesel())),
            );
        if let Some(scope_type) = &acquisition.scope_type {
            query = query.filter(lockstep_jobs::scope_type.eq(scope_type.clone()));
        }
        if let Some(tenant_id) = &acquisition.tenant_id {
            query = query.filter(lockstep_jobs::tenant_id.eq(tenant_id.clone()));
        }

        let candidates: Vec<String> = claimable(query, now)
            .select(lockstep_jobs::id)
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()))
            .limit(acquisition.number_of_tasks as i64)
            .load(&mut conn)
            .await
            .map_err(AppError::from)?;
        drop(conn);

        let claimed = self
            .bulk_update_job_lock(
                &candidates,
                &[JobState::ExternalWorker],
                &acquisition.worker_id,
                acquisition.lock_expiration_time,
                now,
            )
            .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let query = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::id.eq_any(claimed))
            .order((lockstep_jobs::create_time.asc(), lockstep_jobs::id.asc()));
        load_rows(&mut conn, query).await
    }

    async fn complete_external_job(
        &self,
        id: &str,
        worker_id: &str,
        continuation_handler_type: &str,
        variables: &[Variable],
    ) -> AppResult<Job> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let locked = lock_job(conn, id).await?;
                check_external_owner(locked.as_ref().map(|(_, job)| job), id, worker_id)?;
                let Some((row, before)) = locked else {
                    return Err(AppError::job_not_found(id));
                };

                let mut job = before.clone();
                job.state = JobState::Ready;
                job.handler_type = continuation_handler_type.to_string();
                job.due_date = None;
                job.clear_lock();
                job.revision += 1;
                self.store_in(conn, &row, &before, &job).await?;

                let (scope_id, scope_type) = job.variable_scope();
                Self::write_variables(conn, &scope_id, scope_type.as_deref(), variables).await?;
                Ok(job)
            }
            .scope_boxed()
        })
        .await
    }

    async fn fail_external_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &ExternalJobFailure,
        now: Timestamp,
    ) -> AppResult<Job> {
        self.update_external(id, worker_id, |job| {
            let target = failure.target_for(job, now);
            apply_failure(
                job,
                &target,
                failure.error_message.clone(),
                failure.error_details.clone(),
                now,
            );
        })
        .await
    }

    async fn unacquire_external_job(&self, id: &str, worker_id: &str) -> AppResult<Job> {
        self.update_external(id, worker_id, |job| {
            job.clear_lock();
            job.revision += 1;
        })
        .await
    }

    async fn unacquire_all_external_jobs(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> AppResult<u64> {
        let mut conn = self.conn().await?;
        let mut target = lockstep_jobs::table
            .into_boxed()
            .filter(lockstep_jobs::state.eq(JobState::ExternalWorker))
            .filter(lockstep_jobs::lock_owner.eq(worker_id.to_string()));
        if let Some(tenant_id) = tenant_id {
            target = target.filter(lockstep_jobs::tenant_id.eq(tenant_id.to_string()));
        }
        let ids: Vec<String> = target
            .select(lockstep_jobs::id)
            .load(&mut conn)
            .await
            .map_err(AppError::from)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let released = diesel::update(
            lockstep_jobs::table
                .filter(lockstep_jobs::id.eq_any(ids))
                .filter(lockstep_jobs::lock_owner.eq(worker_id)),
        )
        .set((
            lockstep_jobs::lock_owner.eq(None::<String>),
            lockstep_jobs::lock_expiration_time.eq(None::<jiff_diesel::Timestamp>),
            lockstep_jobs::revision.eq(lockstep_jobs::revision + 1),
        ))
        .execute(&mut conn)
        .await
        .map_err(AppError::from)?;
        Ok(released as u64)
    }

    async fn extend_external_job_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_expiration_time: Timestamp,
    ) -> AppResult<Job> {
        self.update_external(id, worker_id, |job| {
            job.lock_expiration_time = Some(lock_expiration_time);
            job.revision += 1;
        })
        .await
    }

    async fn scope_variables(&self, scope_id: &str) -> AppResult<Vec<Variable>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ScopeVariableRow> = lockstep_scope_variables::table
            .filter(lockstep_scope_variables::scope_id.eq(scope_id))
            .order(lockstep_scope_variables::name.asc())
            .select(ScopeVariableRow::as_select())
            .load(&mut conn)
            .await
            .map_err(AppError::from)?;
        Ok(rows.into_iter().map(Variable::from).collect())
    }
}
