use std::fmt;

/// Ledger store error kinds, shared by the Postgres and in-memory backends
#[derive(Debug, Clone)]
pub enum DatabaseErrorKind {
    /// Connection pool is exhausted
    PoolExhausted,
    /// Record not found
    NotFound {
        entity: String,
        id: String,
    },
    /// Unique constraint violation (e.g., duplicate key)
    UniqueConstraintViolation {
        constraint: String,
    },
    /// A concurrent writer won the race for the same rows
    Conflict {
        message: String,
    },
    /// Query execution error
    QueryError {
        message: String,
    },
    /// Transaction error
    TransactionError {
        message: String,
    },
    /// Database connection error
    ConnectionError {
        message: String,
    },
    /// Configuration error
    ConfigError {
        message: String,
    },
    /// Unknown error
    Unknown {
        message: String,
    },
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub context: Option<String>,
    pub is_retryable: bool,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        let is_retryable = matches!(
            kind,
            DatabaseErrorKind::PoolExhausted
                | DatabaseErrorKind::ConnectionError { .. }
                | DatabaseErrorKind::Conflict { .. }
        );

        Self {
            kind,
            context: None,
            is_retryable,
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::new(DatabaseErrorKind::Conflict {
            message: message.into(),
        })
    }

    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    /// True when the store rejected the write because another transaction
    /// touched the same account or idempotency key first.
    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Conflict { .. })
    }

    /// Map SQLx error to our custom error type
    #[cfg(feature = "postgres")]
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::new(DatabaseErrorKind::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            }),
            sqlx::Error::PoolTimedOut => Self::new(DatabaseErrorKind::PoolExhausted),
            sqlx::Error::PoolClosed => Self::new(DatabaseErrorKind::ConnectionError {
                message: "Connection pool is closed".to_string(),
            }),
            sqlx::Error::Configuration(msg) => Self::new(DatabaseErrorKind::ConfigError {
                message: msg.to_string(),
            }),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                match code.as_deref() {
                    // unique_violation
                    Some("23505") => Self::new(DatabaseErrorKind::UniqueConstraintViolation {
                        constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                    }),
                    // serialization_failure, deadlock_detected
                    Some("40001") | Some("40P01") => Self::conflict(db_err.message()),
                    _ => Self::new(DatabaseErrorKind::QueryError {
                        message: db_err.message().to_string(),
                    }),
                }
            }
            sqlx::Error::Io(io_err) => Self::new(DatabaseErrorKind::ConnectionError {
                message: io_err.to_string(),
            }),
            _ => Self::new(DatabaseErrorKind::Unknown {
                message: error.to_string(),
            }),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match &self.kind {
            DatabaseErrorKind::PoolExhausted => {
                "Database connection pool exhausted. Please try again.".to_string()
            }
            DatabaseErrorKind::NotFound { entity, id } => {
                format!("{} with ID '{}' not found", entity, id)
            }
            DatabaseErrorKind::UniqueConstraintViolation { constraint } => {
                format!("Unique constraint '{}' violated", constraint)
            }
            DatabaseErrorKind::Conflict { message } => {
                format!("Concurrent write conflict: {}", message)
            }
            DatabaseErrorKind::QueryError { message } => {
                format!("Database query failed: {}", message)
            }
            DatabaseErrorKind::TransactionError { message } => {
                format!("Transaction failed: {}", message)
            }
            DatabaseErrorKind::ConnectionError { message } => {
                format!("Database connection error: {}", message)
            }
            DatabaseErrorKind::ConfigError { message } => {
                format!("Database configuration error: {}", message)
            }
            DatabaseErrorKind::Unknown { message } => {
                format!("Unknown database error: {}", message)
            }
        };

        if let Some(context) = &self.context {
            write!(f, "{} ({})", message, context)
        } else {
            write!(f, "{}", message)
        }
    }
}

impl std::error::Error for DatabaseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = DatabaseError::conflict("account row changed");
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_is_terminal() {
        let err = DatabaseError::new(DatabaseErrorKind::NotFound {
            entity: "UserAccount".to_string(),
            id: "u1".to_string(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "UserAccount with ID 'u1' not found");
    }

    #[test]
    fn test_context_is_appended() {
        let err = DatabaseError::new(DatabaseErrorKind::TransactionError {
            message: "commit failed".to_string(),
        })
        .with_context("apply_credit");
        assert_eq!(
            err.to_string(),
            "Transaction failed: commit failed (apply_credit)"
        );
    }
}
