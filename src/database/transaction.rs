use crate::database::error::{DatabaseError, DatabaseErrorKind};
use sqlx::Transaction as SqlxTransaction;
use sqlx::{PgPool, Postgres};
use tracing::{debug, error as log_error};

/// Database transaction wrapper for atomic operations
///
/// Dropping an uncommitted transaction rolls it back.
pub struct DatabaseTransaction {
    transaction: Option<SqlxTransaction<'static, Postgres>>,
}

impl DatabaseTransaction {
    /// Begin a new transaction
    pub async fn begin(pool: &PgPool) -> Result<Self, DatabaseError> {
        debug!("Beginning database transaction");

        let transaction = pool.begin().await.map_err(|e| {
            log_error!("Failed to begin transaction: {}", e);
            DatabaseError::from_sqlx(e).with_context("begin")
        })?;

        Ok(Self {
            transaction: Some(transaction),
        })
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> Result<(), DatabaseError> {
        let tx = self.take()?;
        debug!("Committing transaction");

        tx.commit().await.map_err(|e| {
            log_error!("Failed to commit transaction: {}", e);
            DatabaseError::from_sqlx(e).with_context("commit")
        })
    }

    /// Rollback the transaction
    pub async fn rollback(mut self) -> Result<(), DatabaseError> {
        let tx = self.take()?;
        debug!("Rolling back transaction");

        tx.rollback().await.map_err(|e| {
            log_error!("Failed to rollback transaction: {}", e);
            DatabaseError::from_sqlx(e).with_context("rollback")
        })
    }

    /// Get a mutable reference to the transaction for executing queries
    pub fn tx_mut(&mut self) -> Result<&mut SqlxTransaction<'static, Postgres>, DatabaseError> {
        self.transaction.as_mut().ok_or_else(completed)
    }

    fn take(&mut self) -> Result<SqlxTransaction<'static, Postgres>, DatabaseError> {
        self.transaction.take().ok_or_else(completed)
    }
}

fn completed() -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::TransactionError {
        message: "Transaction already completed".to_string(),
    })
}
