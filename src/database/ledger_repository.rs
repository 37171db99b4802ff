use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::transaction::DatabaseTransaction;
use crate::ledger::{
    AppliedPayment, Gateway, IdempotencyKey, LedgerStore, LedgerTransaction, PaymentRecord,
    PaymentRecordStatus, UserAccount,
};

#[derive(Debug, Clone, FromRow)]
struct AppliedPaymentRow {
    gateway: String,
    reference: String,
    user_id: String,
    coins: i64,
    balance_after: i64,
    applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct AccountRow {
    id: String,
    balance: i64,
}

#[derive(Debug, Clone, FromRow)]
struct HistoryRow {
    gateway: String,
    reference: String,
    coins: i64,
    gross_amount: Decimal,
    currency: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AppliedPaymentRow> for AppliedPayment {
    type Error = DatabaseError;

    fn try_from(row: AppliedPaymentRow) -> Result<Self, Self::Error> {
        Ok(AppliedPayment {
            key: IdempotencyKey::new(parse_gateway(&row.gateway)?, row.reference),
            user_id: row.user_id,
            coins: to_u64(row.coins, "coins")?,
            balance_after: to_u64(row.balance_after, "balance_after")?,
            applied_at: row.applied_at,
        })
    }
}

impl TryFrom<HistoryRow> for PaymentRecord {
    type Error = DatabaseError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            gateway: parse_gateway(&row.gateway)?,
            reference: row.reference,
            coins: to_u64(row.coins, "coins")?,
            gross_amount: row.gross_amount,
            currency: row.currency,
            status: PaymentRecordStatus::Success,
            timestamp: row.created_at,
            metadata: match row.metadata {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        })
    }
}

fn parse_gateway(raw: &str) -> DbResult<Gateway> {
    raw.parse().map_err(|_| {
        DatabaseError::new(DatabaseErrorKind::QueryError {
            message: format!("unknown gateway '{}' in ledger", raw),
        })
    })
}

fn to_u64(value: i64, column: &str) -> DbResult<u64> {
    u64::try_from(value).map_err(|_| {
        DatabaseError::new(DatabaseErrorKind::QueryError {
            message: format!("negative {} in ledger: {}", column, value),
        })
    })
}

fn to_i64(value: u64, column: &str) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| {
        DatabaseError::new(DatabaseErrorKind::QueryError {
            message: format!("{} {} exceeds the storable range", column, value),
        })
    })
}

/// Tags a driver error with the ledger operation that raised it
fn store_error(operation: &'static str) -> impl Fn(sqlx::Error) -> DatabaseError {
    move |error| DatabaseError::from_sqlx(error).with_context(operation)
}

/// A concurrent transaction inserted the same `(gateway, reference)` first.
/// Reported as a conflict so the applier retries and observes the winner.
fn claim_error(operation: &'static str) -> impl Fn(sqlx::Error) -> DatabaseError {
    move |error| {
        let error = DatabaseError::from_sqlx(error);
        let error = match &error.kind {
            DatabaseErrorKind::UniqueConstraintViolation { constraint } => DatabaseError::conflict(
                format!("idempotency key already claimed ({})", constraint),
            ),
            _ => error,
        };
        error.with_context(operation)
    }
}

/// Ledger backed by Postgres
///
/// Each credit runs in one database transaction. The account row is created if
/// absent and locked with `SELECT ... FOR UPDATE` before its balance is read,
/// so concurrent credits to one user serialize on that row.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> DbResult<Box<dyn LedgerTransaction>> {
        let inner = DatabaseTransaction::begin(&self.pool).await?;
        Ok(Box::new(PgLedgerTransaction { inner }))
    }

    async fn find_account(&self, user_id: &str) -> DbResult<Option<UserAccount>> {
        let account = sqlx::query_as::<_, AccountRow>(
            "SELECT id, balance FROM user_accounts WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error("find_account"))?;

        let Some(account) = account else {
            return Ok(None);
        };

        let history = sqlx::query_as::<_, HistoryRow>(
            "SELECT gateway, reference, coins, gross_amount, currency, metadata, created_at
             FROM payment_history
             WHERE user_id = $1
             ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("load_history"))?
        .into_iter()
        .map(PaymentRecord::try_from)
        .collect::<DbResult<Vec<_>>>()?;

        Ok(Some(UserAccount {
            id: account.id,
            balance: to_u64(account.balance, "balance")?,
            history,
        }))
    }

    async fn health_check(&self) -> DbResult<()> {
        crate::database::health_check(&self.pool).await
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgLedgerTransaction {
    inner: DatabaseTransaction,
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn find_applied(&mut self, key: &IdempotencyKey) -> DbResult<Option<AppliedPayment>> {
        let tx = self.inner.tx_mut()?;
        let row = sqlx::query_as::<_, AppliedPaymentRow>(
            "SELECT gateway, reference, user_id, coins, balance_after, applied_at
             FROM applied_payments
             WHERE gateway = $1 AND reference = $2",
        )
        .bind(key.gateway.as_str())
        .bind(&key.reference)
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_error("find_applied"))?;

        row.map(AppliedPayment::try_from).transpose()
    }

    async fn current_balance(&mut self, user_id: &str) -> DbResult<u64> {
        let tx = self.inner.tx_mut()?;

        sqlx::query("INSERT INTO user_accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(store_error("create_account"))?;

        let balance: i64 =
            sqlx::query_scalar("SELECT balance FROM user_accounts WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(store_error("lock_account"))?;

        debug!(user_id, balance, "account row locked");
        to_u64(balance, "balance")
    }

    async fn stage_credit(
        &mut self,
        user_id: &str,
        new_balance: u64,
        record: &PaymentRecord,
    ) -> DbResult<()> {
        let new_balance = to_i64(new_balance, "balance")?;
        let coins = to_i64(record.coins, "coins")?;
        let tx = self.inner.tx_mut()?;

        let updated = sqlx::query(
            "UPDATE user_accounts SET balance = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(new_balance)
        .execute(&mut **tx)
        .await
        .map_err(store_error("update_balance"))?;

        if updated.rows_affected() != 1 {
            return Err(DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "UserAccount".to_string(),
                id: user_id.to_string(),
            }));
        }

        sqlx::query(
            "INSERT INTO applied_payments (gateway, reference, user_id, coins, balance_after, applied_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.gateway.as_str())
        .bind(&record.reference)
        .bind(user_id)
        .bind(coins)
        .bind(new_balance)
        .bind(record.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(claim_error("claim_idempotency_key"))?;

        sqlx::query(
            "INSERT INTO payment_history
                (user_id, gateway, reference, coins, gross_amount, currency, status, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(user_id)
        .bind(record.gateway.as_str())
        .bind(&record.reference)
        .bind(coins)
        .bind(record.gross_amount)
        .bind(&record.currency)
        .bind(record.status.as_str())
        .bind(serde_json::Value::Object(record.metadata.clone()))
        .bind(record.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(claim_error("append_history"))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.inner.rollback().await
    }
}
