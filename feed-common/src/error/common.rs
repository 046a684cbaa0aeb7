//! Common error types shared across crates.
//!
//! Crate-specific errors wrap these using `#[from]`.

use thiserror::Error;

/// Database-related errors.
///
/// Covers pool acquisition, query execution and transaction control.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Query execution failed (bad SQL, constraint violation, ...)
    #[error("Query failed: {0}")]
    Query(String),

    /// Connection to the database failed or was dropped mid-operation
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Transaction failed (commit, rollback, etc.)
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Connection pool exhausted
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

/// SQLSTATEs that abort a transaction but succeed when replayed:
/// serialization failure and deadlock
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted,
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref())) =>
            {
                DatabaseError::Transaction(err.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => DatabaseError::Connection(err.to_string()),
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Configuration-related errors.
///
/// Use this for configuration loading, parsing, and validation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Field has invalid value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration combination
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigurationError {
    /// Create an InvalidValue error
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_pool_timeout_maps_to_exhausted() {
        let err: DatabaseError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DatabaseError::PoolExhausted));
    }

    #[test]
    fn test_sqlx_io_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: DatabaseError = sqlx::Error::Io(io).into();
        assert!(matches!(err, DatabaseError::Connection(_)));

        let err: DatabaseError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DatabaseError::Connection(_)));
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_query() {
        let err: DatabaseError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    /// Server-side error carrying a SQLSTATE, as raised at COMMIT
    #[derive(Debug)]
    struct ServerError(&'static str);

    impl std::fmt::Display for ServerError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "server error {}", self.0)
        }
    }

    impl std::error::Error for ServerError {}

    impl sqlx::error::DatabaseError for ServerError {
        fn message(&self) -> &str {
            "server error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(std::borrow::Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.0 {
                "23505" => sqlx::error::ErrorKind::UniqueViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    #[test]
    fn test_deferred_constraint_violation_is_a_query_error() {
        let err: DatabaseError = sqlx::Error::Database(Box::new(ServerError("23505"))).into();
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    #[test]
    fn test_serialization_failure_and_deadlock_map_to_transaction() {
        for code in ["40001", "40P01"] {
            let err: DatabaseError = sqlx::Error::Database(Box::new(ServerError(code))).into();
            assert!(matches!(err, DatabaseError::Transaction(_)), "{}", code);
        }
    }

    #[test]
    fn test_invalid_value_message() {
        let err = ConfigurationError::invalid_value("sync.parallel_workers", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'sync.parallel_workers': must be > 0"
        );
    }
}
