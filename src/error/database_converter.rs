use crate::error::AppError;
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Utility for converting database errors to structured AppError variants.
pub struct DatabaseErrorConverter;

impl DatabaseErrorConverter {
    /// Converts a Diesel error to an appropriate AppError variant.
    pub fn convert_diesel_error(error: DieselError, operation: &str) -> AppError {
        match error {
            DieselError::DatabaseError(kind, info) => {
                Self::convert_database_error(kind, info.as_ref(), operation)
            }
            DieselError::NotFound => AppError::NotFound {
                entity: "resource".to_string(),
                field: "id".to_string(),
                value: "unknown".to_string(),
            },
            other => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::from(other),
            },
        }
    }

    fn convert_database_error(
        kind: DatabaseErrorKind,
        info: &(dyn diesel::result::DatabaseErrorInformation + Send + Sync),
        operation: &str,
    ) -> AppError {
        let message = info.message();

        match kind {
            DatabaseErrorKind::UniqueViolation => {
                let (entity, field) = Self::unique_target(info.constraint_name());
                AppError::Duplicate {
                    entity,
                    field: field.clone(),
                    value: Self::extract_key_value(message, &field)
                        .unwrap_or_else(|| "unknown".to_string()),
                }
            }
            _ => AppError::Database {
                operation: operation.to_string(),
                source: anyhow::Error::msg(format!("Database error: {}", message)),
            },
        }
    }

    /// Maps the constraint names declared by the job migrations to entity/field pairs.
    fn unique_target(constraint: Option<&str>) -> (String, String) {
        match constraint {
            Some("lockstep_jobs_pkey") => ("Job".to_string(), "id".to_string()),
            Some("lockstep_jobs_correlation_id_key") => {
                ("Job".to_string(), "correlation_id".to_string())
            }
            Some("lockstep_byte_arrays_pkey") => ("ByteArray".to_string(), "id".to_string()),
            Some(other) => (other.to_string(), "unknown".to_string()),
            None => ("resource".to_string(), "unknown".to_string()),
        }
    }

    /// Pulls `value` out of Postgres' `DETAIL: Key (field)=(value) already exists.`
    fn extract_key_value(message: &str, field: &str) -> Option<String> {
        let marker = format!("Key ({})=(", field);
        let start = message.find(&marker)? + marker.len();
        let end = message[start..].find(')')? + start;
        Some(message[start..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    struct MockDatabaseErrorInfo {
        message: String,
        constraint_name: Option<String>,
    }

    impl diesel::result::DatabaseErrorInformation for MockDatabaseErrorInfo {
        fn message(&self) -> &str {
            &self.message
        }

        fn details(&self) -> Option<&str> {
            None
        }

        fn hint(&self) -> Option<&str> {
            None
        }

        fn table_name(&self) -> Option<&str> {
            None
        }

        fn column_name(&self) -> Option<&str> {
            None
        }

        fn constraint_name(&self) -> Option<&str> {
            self.constraint_name.as_deref()
        }

        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    #[test]
    fn test_convert_not_found_error() {
        let result = DatabaseErrorConverter::convert_diesel_error(DieselError::NotFound, "find job");
        assert!(matches!(result, AppError::NotFound { .. }));
    }

    #[test]
    fn test_convert_duplicate_correlation_id() {
        let info = MockDatabaseErrorInfo {
            message: "duplicate key value violates unique constraint \"lockstep_jobs_correlation_id_key\"\nDETAIL: Key (correlation_id)=(timer-42) already exists.".to_string(),
            constraint_name: Some("lockstep_jobs_correlation_id_key".to_string()),
        };
        let error = DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, Box::new(info));

        match DatabaseErrorConverter::convert_diesel_error(error, "insert job") {
            AppError::Duplicate {
                entity,
                field,
                value,
            } => {
                assert_eq!(entity, "Job");
                assert_eq!(field, "correlation_id");
                assert_eq!(value, "timer-42");
            }
            other => panic!("Expected Duplicate error, got: {:?}", other),
        }
    }

    #[test]
    fn test_convert_other_database_error() {
        let info = MockDatabaseErrorInfo {
            message: "deadlock detected".to_string(),
            constraint_name: None,
        };
        let error =
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, Box::new(info));

        match DatabaseErrorConverter::convert_diesel_error(error, "claim jobs") {
            AppError::Database { operation, .. } => assert_eq!(operation, "claim jobs"),
            other => panic!("Expected Database error, got: {:?}", other),
        }
    }
}
