//! Diesel row types for the job tables.

use diesel::prelude::*;
use jiff_diesel::ToDiesel;

use crate::jobs::types::{Job, JobState, Variable};
use crate::schema::{lockstep_byte_arrays, lockstep_jobs, lockstep_scope_variables};

/// Longest handler configuration stored inline; longer ones go to the
/// byte-array table.
pub const MAX_INLINE_CONFIGURATION: usize = 4000;

/// Longest persisted exception message
pub const MAX_EXCEPTION_MESSAGE: usize = 4000;

// ============================================================================
// Job rows
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = lockstep_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct JobRow {
    pub id: String,
    pub revision: i32,
    pub state: JobState,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub configuration_ref: Option<String>,
    pub exception_message: Option<String>,
    pub exception_ref: Option<String>,
    pub retries: i32,
    pub failed_attempts: i32,
    pub dead_letter_time: Option<jiff_diesel::Timestamp>,
    pub due_date: Option<jiff_diesel::Timestamp>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<jiff_diesel::Timestamp>,
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
    pub create_time: jiff_diesel::Timestamp,
}

impl JobRow {
    /// Convert to the domain type with already-resolved large payloads
    pub fn into_job(
        self,
        handler_configuration: Option<String>,
        exception_stacktrace: Option<String>,
    ) -> Job {
        Job {
            id: self.id,
            revision: self.revision,
            state: self.state,
            handler_type: self.handler_type,
            handler_configuration: handler_configuration.or(self.handler_configuration),
            exception_message: self.exception_message,
            exception_stacktrace,
            retries: self.retries,
            failed_attempts: self.failed_attempts,
            dead_letter_time: self.dead_letter_time.map(|d| d.to_jiff()),
            due_date: self.due_date.map(|d| d.to_jiff()),
            lock_owner: self.lock_owner,
            lock_expiration_time: self.lock_expiration_time.map(|d| d.to_jiff()),
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
            create_time: self.create_time.to_jiff(),
        }
    }

    pub fn byte_array_refs(&self) -> impl Iterator<Item = &String> {
        self.configuration_ref.iter().chain(self.exception_ref.iter())
    }
}

/// Full row image used for inserts and whole-row updates
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = lockstep_jobs)]
#[diesel(treat_none_as_null = true)]
pub struct JobRecord {
    pub id: String,
    pub revision: i32,
    pub state: JobState,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub configuration_ref: Option<String>,
    pub exception_message: Option<String>,
    pub exception_ref: Option<String>,
    pub retries: i32,
    pub failed_attempts: i32,
    pub dead_letter_time: Option<jiff_diesel::Timestamp>,
    pub due_date: Option<jiff_diesel::Timestamp>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<jiff_diesel::Timestamp>,
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
    pub create_time: jiff_diesel::Timestamp,
}

impl JobRecord {
    /// Row image of `job`; the payload columns are filled in by the caller
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            revision: job.revision,
            state: job.state,
            handler_type: job.handler_type.clone(),
            handler_configuration: None,
            configuration_ref: None,
            exception_message: job
                .exception_message
                .as_deref()
                .map(|m| truncate_chars(m, MAX_EXCEPTION_MESSAGE)),
            exception_ref: None,
            retries: job.retries,
            failed_attempts: job.failed_attempts,
            dead_letter_time: job.dead_letter_time.map(|d| d.to_diesel()),
            due_date: job.due_date.map(|d| d.to_diesel()),
            lock_owner: job.lock_owner.clone(),
            lock_expiration_time: job.lock_expiration_time.map(|d| d.to_diesel()),
            scope_id: job.scope_id.clone(),
            scope_type: job.scope_type.clone(),
            sub_scope_id: job.sub_scope_id.clone(),
            scope_definition_id: job.scope_definition_id.clone(),
            correlation_id: job.correlation_id.clone(),
            tenant_id: job.tenant_id.clone(),
            category: job.category.clone(),
            element_id: job.element_id.clone(),
            element_name: job.element_name.clone(),
            deployment_id: job.deployment_id.clone(),
            create_time: job.create_time.to_diesel(),
        }
    }
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => value[..cut].to_string(),
        None => value.to_string(),
    }
}

// ============================================================================
// Byte arrays
// ============================================================================

/// Large payload stored out of line; `create_time` defaults in SQL
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = lockstep_byte_arrays)]
pub struct NewByteArray {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

// ============================================================================
// Scope variables
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = lockstep_scope_variables)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ScopeVariableRow {
    pub name: String,
    pub var_type: String,
    pub value: serde_json::Value,
}

impl From<ScopeVariableRow> for Variable {
    fn from(row: ScopeVariableRow) -> Self {
        Variable {
            name: row.name,
            var_type: row.var_type,
            value: row.value,
        }
    }
}

/// Upsert image of one variable; `update_time` is set in SQL
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = lockstep_scope_variables)]
pub struct NewScopeVariable {
    pub scope_id: String,
    pub name: String,
    pub scope_type: Option<String>,
    pub var_type: String,
    pub value: serde_json::Value,
}

impl NewScopeVariable {
    pub fn new(scope_id: &str, scope_type: Option<&str>, variable: &Variable) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            name: variable.name.clone(),
            scope_type: scope_type.map(str::to_string),
            var_type: variable.var_type.clone(),
            value: variable.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
