use std::fmt;
use std::str::FromStr;

use diesel_derive_enum::DbEnum;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Where a job currently lives. A job is in exactly one state at a time and
/// keeps its id across moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::LockstepJobState")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Immediately acquirable by the async executor
    Ready,
    /// Waiting for its due date
    Timer,
    /// Excluded from acquisition until activated
    Suspended,
    /// Retries exhausted; waits for an operator
    DeadLetter,
    /// Deferred history write, acquired like a ready job
    History,
    /// Leased to out-of-process workers by topic
    ExternalWorker,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Ready,
        JobState::Timer,
        JobState::Suspended,
        JobState::DeadLetter,
        JobState::History,
        JobState::ExternalWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Timer => "timer",
            JobState::Suspended => "suspended",
            JobState::DeadLetter => "dead_letter",
            JobState::History => "history",
            JobState::ExternalWorker => "external_worker",
        }
    }

    /// States the internal executor runs handlers for
    pub fn is_executable(&self) -> bool {
        matches!(self, JobState::Ready | JobState::History)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| {
                AppError::validation(
                    "state",
                    format!(
                        "Unknown job state '{}'. Valid states are: ready, timer, suspended, dead_letter, history, external_worker",
                        s
                    ),
                )
            })
    }
}

/// Which jobs an executor instance may acquire, keyed on `scope_type`.
///
/// Lets e.g. a process engine and a case engine share one table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobExecutionScope {
    #[default]
    All,
    /// Only jobs without a scope type
    Unscoped,
    ScopeType(String),
}

impl JobExecutionScope {
    pub fn from_setting(value: &str) -> Self {
        match value.trim() {
            "" | "all" | "*" => JobExecutionScope::All,
            "unscoped" | "none" => JobExecutionScope::Unscoped,
            other => JobExecutionScope::ScopeType(other.to_string()),
        }
    }

    pub fn matches(&self, scope_type: Option<&str>) -> bool {
        match self {
            JobExecutionScope::All => true,
            JobExecutionScope::Unscoped => scope_type.is_none(),
            JobExecutionScope::ScopeType(expected) => scope_type == Some(expected.as_str()),
        }
    }
}

impl fmt::Display for JobExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobExecutionScope::All => f.write_str("all"),
            JobExecutionScope::Unscoped => f.write_str("unscoped"),
            JobExecutionScope::ScopeType(scope_type) => f.write_str(scope_type),
        }
    }
}

/// A persisted job in any state.
///
/// `handler_configuration` and `exception_stacktrace` are always resolved,
/// whatever storage the repository uses for large payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub revision: i32,
    pub state: JobState,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub retries: i32,
    /// Failures recorded since creation or the last resurrection; drives
    /// the backoff exponent
    pub failed_attempts: i32,
    /// When the job last became a dead letter
    pub dead_letter_time: Option<Timestamp>,
    pub due_date: Option<Timestamp>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<Timestamp>,
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub sub_scope_id: Option<String>,
    pub scope_definition_id: Option<String>,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub category: Option<String>,
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    pub deployment_id: Option<String>,
    pub create_time: Timestamp,
}

impl Job {
    /// Claimed by someone whose lock has not expired at `now`
    pub fn is_locked_at(&self, now: Timestamp) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expiration)) => expiration >= now,
            _ => false,
        }
    }

    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }

    /// Unlocked, or the previous lock has lapsed
    pub fn is_claimable_at(&self, now: Timestamp) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (None, _) => true,
            (Some(_), Some(expiration)) => expiration < now,
            (Some(_), None) => false,
        }
    }

    pub fn is_due_at(&self, now: Timestamp) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Scope that variables produced by this job are written to; the job's
    /// own id when it has no owning scope.
    pub fn variable_scope(&self) -> (String, Option<String>) {
        match &self.scope_id {
            Some(scope_id) => (scope_id.clone(), self.scope_type.clone()),
            None => (self.id.clone(), Some(JOB_VARIABLE_SCOPE.to_string())),
        }
    }

    /// Topic of an external worker job
    pub fn topic(&self) -> Option<&str> {
        if self.state == JobState::ExternalWorker {
            self.handler_configuration.as_deref()
        } else {
            None
        }
    }

    pub(crate) fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

/// Scope type used for variables attached directly to a job
pub const JOB_VARIABLE_SCOPE: &str = "job";

/// Description of a job to create; the id, state and create time are
/// assigned when it is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    /// Falls back to the configured default when unset
    pub retries: Option<i32>,
    pub due_date: Option<Timestamp>,
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub sub_scope_id: Option<String>,
    pub scope_definition_id: Option<String>,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub category: Option<String>,
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    pub deployment_id: Option<String>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            ..Default::default()
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    /// Serialize a typed configuration as JSON
    pub fn with_json_configuration<T: Serialize>(mut self, configuration: &T) -> Result<Self, AppError> {
        let encoded = serde_json::to_string(configuration).map_err(|e| AppError::BadRequest {
            message: format!("Job configuration is not serializable: {}", e),
        })?;
        self.handler_configuration = Some(encoded);
        Ok(self)
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_due_date(mut self, due_date: Timestamp) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>, scope_type: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self.scope_type = Some(scope_type.into());
        self
    }

    pub fn with_sub_scope(mut self, sub_scope_id: impl Into<String>) -> Self {
        self.sub_scope_id = Some(sub_scope_id.into());
        self
    }

    pub fn with_scope_definition(mut self, scope_definition_id: impl Into<String>) -> Self {
        self.scope_definition_id = Some(scope_definition_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_element(mut self, element_id: impl Into<String>, element_name: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self.element_name = Some(element_name.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    /// Fill scope, tenant and deployment from `parent` where unset
    pub fn inheriting_from(mut self, parent: &Job) -> Self {
        if self.scope_id.is_none() {
            self.scope_id = parent.scope_id.clone();
            self.scope_type = parent.scope_type.clone();
            self.sub_scope_id = parent.sub_scope_id.clone();
            self.scope_definition_id = parent.scope_definition_id.clone();
        }
        self.tenant_id = self.tenant_id.or_else(|| parent.tenant_id.clone());
        self.deployment_id = self.deployment_id.or_else(|| parent.deployment_id.clone());
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.handler_type.trim().is_empty() {
            return Err(AppError::validation("handler_type", "Handler type cannot be empty"));
        }
        if let Some(retries) = self.retries {
            if retries < 0 {
                return Err(AppError::validation("retries", "Retries cannot be negative"));
            }
        }
        Ok(())
    }

    /// Materialize into a job record in `state`
    pub fn into_job(self, id: String, state: JobState, default_retries: i32, now: Timestamp) -> Job {
        Job {
            id,
            revision: 1,
            state,
            handler_type: self.handler_type,
            handler_configuration: self.handler_configuration,
            exception_message: None,
            exception_stacktrace: None,
            retries: self.retries.unwrap_or(default_retries),
            failed_attempts: 0,
            dead_letter_time: (state == JobState::DeadLetter).then_some(now),
            due_date: self.due_date,
            lock_owner: None,
            lock_expiration_time: None,
            scope_id: self.scope_id,
            scope_type: self.scope_type,
            sub_scope_id: self.sub_scope_id,
            scope_definition_id: self.scope_definition_id,
            correlation_id: self.correlation_id,
            tenant_id: self.tenant_id,
            category: self.category,
            element_id: self.element_id,
            element_name: self.element_name,
            deployment_id: self.deployment_id,
            create_time: now,
        }
    }
}

/// A scope variable as a name/type/value triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub value: serde_json::Value,
}

impl Variable {
    pub fn new(name: impl Into<String>, var_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            var_type: var_type.into(),
            value,
        }
    }

    /// Infer the type tag from a JSON value
    pub fn from_json(name: impl Into<String>, value: serde_json::Value) -> Self {
        let var_type = match &value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "long",
            serde_json::Value::Number(_) => "double",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => "json",
        };
        Self::new(name, var_type, value)
    }
}

/// Variables destined for one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeVariableWrite {
    pub scope_id: String,
    pub scope_type: Option<String>,
    pub variables: Vec<Variable>,
}

/// Writes applied in the same transaction that deletes a completed job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionEffects {
    pub variables: Vec<ScopeVariableWrite>,
    pub new_jobs: Vec<Job>,
}

/// Where a failed job goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTarget {
    /// Reschedule as a timer with the remaining retries
    Timer { retries: i32, due_date: Timestamp },
    /// Stay in the current state, unlocked, with the remaining retries
    InPlace {
        retries: i32,
        due_date: Option<Timestamp>,
    },
    DeadLetter,
}

impl FailureTarget {
    pub fn state_for(&self, current: JobState) -> JobState {
        match self {
            FailureTarget::Timer { .. } => JobState::Timer,
            FailureTarget::InPlace { .. } => current,
            FailureTarget::DeadLetter => JobState::DeadLetter,
        }
    }
}

/// Failure of a claimed job, recorded against the lock holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: String,
    pub lock_owner: String,
    pub exception_message: String,
    pub exception_stacktrace: Option<String>,
    pub target: FailureTarget,
    pub failed_at: Timestamp,
}

/// Filter for administrative listing and counting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub states: Vec<JobState>,
    pub handler_type: Option<String>,
    pub tenant_id: Option<String>,
    pub scope_id: Option<String>,
    pub sub_scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub correlation_id: Option<String>,
    pub lock_owner: Option<String>,
    pub due_before: Option<Timestamp>,
    pub due_after: Option<Timestamp>,
    pub with_exception: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl JobQuery {
    pub fn in_state(state: JobState) -> Self {
        Self {
            states: vec![state],
            ..Default::default()
        }
    }

    /// Jobs of one execution in any state, keyed by the sub-scope the
    /// execution is recorded under
    pub fn for_sub_scope(sub_scope_id: impl Into<String>) -> Self {
        Self {
            sub_scope_id: Some(sub_scope_id.into()),
            ..Default::default()
        }
    }

    /// Predicate form of the filter, used by the in-memory repository
    pub fn matches(&self, job: &Job) -> bool {
        fn eq(filter: &Option<String>, value: &Option<String>) -> bool {
            filter.as_ref().is_none_or(|f| value.as_ref() == Some(f))
        }

        (self.states.is_empty() || self.states.contains(&job.state))
            && self.handler_type.as_ref().is_none_or(|h| &job.handler_type == h)
            && eq(&self.tenant_id, &job.tenant_id)
            && eq(&self.scope_id, &job.scope_id)
            && eq(&self.sub_scope_id, &job.sub_scope_id)
            && eq(&self.scope_type, &job.scope_type)
            && eq(&self.correlation_id, &job.correlation_id)
            && eq(&self.lock_owner, &job.lock_owner)
            && self
                .due_before
                .is_none_or(|before| job.due_date.is_some_and(|due| due < before))
            && self
                .due_after
                .is_none_or(|after| job.due_date.is_some_and(|due| due > after))
            && (!self.with_exception || job.exception_message.is_some())
    }
}

/// Candidate selection for an external worker acquire request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalJobAcquisition {
    pub topic: String,
    pub worker_id: String,
    pub number_of_tasks: usize,
    pub lock_expiration_time: Timestamp,
    pub scope_type: Option<String>,
    pub tenant_id: Option<String>,
}

impl ExternalJobAcquisition {
    pub fn accepts(&self, job: &Job, now: Timestamp) -> bool {
        job.state == JobState::ExternalWorker
            && job.handler_configuration.as_deref() == Some(self.topic.as_str())
            && job.is_claimable_at(now)
            && job.is_due_at(now)
            && self
                .scope_type
                .as_ref()
                .is_none_or(|s| job.scope_type.as_ref() == Some(s))
            && self
                .tenant_id
                .as_ref()
                .is_none_or(|t| job.tenant_id.as_ref() == Some(t))
    }
}

/// Failure reported by an external worker for a job it holds
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalJobFailure {
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    /// Explicit remaining retries; the current count minus one otherwise
    pub retries: Option<i32>,
    pub retry_timeout: Option<std::time::Duration>,
}

impl ExternalJobFailure {
    /// Decide the failure target for `job` at `now`
    pub fn target_for(&self, job: &Job, now: Timestamp) -> FailureTarget {
        let remaining = self.retries.unwrap_or(job.retries - 1).max(0);
        let exhausted = match self.retries {
            Some(explicit) => explicit <= 0,
            None => job.retries <= 0,
        };
        if exhausted {
            return FailureTarget::DeadLetter;
        }
        let due_date = self
            .retry_timeout
            .map(|timeout| crate::clock::plus(now, timeout));
        FailureTarget::InPlace {
            retries: remaining,
            due_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::from_second(seconds).unwrap()
    }

    fn job(state: JobState) -> Job {
        NewJob::new("noop").into_job("job-1".to_string(), state, 3, at(1_000))
    }

    #[test]
    fn test_job_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("dead-letter".parse::<JobState>().unwrap(), JobState::DeadLetter);
        assert!("waiting".parse::<JobState>().is_err());
    }

    #[test]
    fn test_execution_scope_matching() {
        assert!(JobExecutionScope::All.matches(None));
        assert!(JobExecutionScope::All.matches(Some("bpmn")));
        assert!(JobExecutionScope::Unscoped.matches(None));
        assert!(!JobExecutionScope::Unscoped.matches(Some("bpmn")));

        let cmmn = JobExecutionScope::from_setting("cmmn");
        assert!(cmmn.matches(Some("cmmn")));
        assert!(!cmmn.matches(Some("bpmn")));
        assert!(!cmmn.matches(None));
    }

    #[test]
    fn test_lock_predicates() {
        let mut job = job(JobState::Ready);
        assert!(job.is_claimable_at(at(1_000)));
        assert!(!job.is_locked_at(at(1_000)));

        job.lock_owner = Some("node-a".to_string());
        job.lock_expiration_time = Some(at(1_060));
        assert!(job.is_locked_at(at(1_030)));
        assert!(!job.is_claimable_at(at(1_030)));
        assert!(job.is_claimable_at(at(1_061)));
        assert!(job.is_locked_by("node-a"));
    }

    #[test]
    fn test_variable_scope_falls_back_to_job_id() {
        let mut job = job(JobState::Ready);
        assert_eq!(
            job.variable_scope(),
            ("job-1".to_string(), Some(JOB_VARIABLE_SCOPE.to_string()))
        );

        job.scope_id = Some("proc-7".to_string());
        job.scope_type = Some("bpmn".to_string());
        assert_eq!(
            job.variable_scope(),
            ("proc-7".to_string(), Some("bpmn".to_string()))
        );
    }

    #[test]
    fn test_new_job_validation() {
        assert!(NewJob::new("").validate().is_err());
        assert!(NewJob::new("noop").with_retries(-1).validate().is_err());
        assert!(NewJob::new("noop").with_retries(0).validate().is_ok());
    }

    #[test]
    fn test_query_matches() {
        let mut job = job(JobState::DeadLetter);
        job.tenant_id = Some("acme".to_string());
        job.exception_message = Some("boom".to_string());

        let query = JobQuery {
            states: vec![JobState::DeadLetter],
            tenant_id: Some("acme".to_string()),
            with_exception: true,
            ..Default::default()
        };
        assert!(query.matches(&job));

        let other_tenant = JobQuery {
            tenant_id: Some("globex".to_string()),
            ..Default::default()
        };
        assert!(!other_tenant.matches(&job));
        assert!(!JobQuery::in_state(JobState::Ready).matches(&job));

        job.sub_scope_id = Some("exec-3".to_string());
        assert!(JobQuery::for_sub_scope("exec-3").matches(&job));
        assert!(!JobQuery::for_sub_scope("exec-4").matches(&job));
    }

    #[test]
    fn test_external_failure_target() {
        let mut job = job(JobState::ExternalWorker);
        job.retries = 2;

        let failure = ExternalJobFailure {
            retry_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(
            failure.target_for(&job, at(2_000)),
            FailureTarget::InPlace {
                retries: 1,
                due_date: Some(at(2_030))
            }
        );

        job.retries = 0;
        assert_eq!(failure.target_for(&job, at(2_000)), FailureTarget::DeadLetter);

        let explicit = ExternalJobFailure {
            retries: Some(5),
            ..Default::default()
        };
        assert_eq!(
            explicit.target_for(&job, at(2_000)),
            FailureTarget::InPlace {
                retries: 5,
                due_date: None
            }
        );
    }

    #[test]
    fn test_variable_type_inference() {
        assert_eq!(Variable::from_json("n", serde_json::json!(3)).var_type, "long");
        assert_eq!(Variable::from_json("f", serde_json::json!(1.5)).var_type, "double");
        assert_eq!(Variable::from_json("o", serde_json::json!({"a": 1})).var_type, "json");
    }
}
