//! Error type for outbox persistence.
//!
//! Every repository returns [`CoreError`]. Database driver errors are folded
//! into a small taxonomy so callers can tell a broken connection apart from a
//! rejected write, which matters for the idempotency ledger where a unique
//! key collision must surface as its own failure.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Requested row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write was rejected by a table constraint.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored data could not be interpreted.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns true when the error came from a unique or check constraint.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::ColumnDecode { index, source } => {
                Self::InvalidInput(format!("failed to decode column {index}: {source}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_constraint_violation());
    }

    #[test]
    fn pool_errors_map_to_database() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CoreError::Database(_)));
        assert!(err.to_string().starts_with("Database error:"));
    }

    #[test]
    fn constraint_violation_is_flagged() {
        let err = CoreError::ConstraintViolation("event_key".into());
        assert!(err.is_constraint_violation());
        assert_eq!(err.to_string(), "Constraint violation: event_key");
    }
}
