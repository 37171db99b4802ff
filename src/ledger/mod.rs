//! Coin ledger: canonical data model and the atomic store capability
//!
//! Balances and payment history live behind [`LedgerStore`]. Every mutation goes
//! through a [`LedgerTransaction`], which is the store's own atomicity primitive:
//! the Postgres backend maps it onto a database transaction with row locks, the
//! in-memory backend onto optimistic version checks at commit time.

pub mod credit;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{LedgerBackend, LedgerConfig};
use crate::database::error::DbResult;
use crate::error::PaymentError;

pub use credit::{CreditApplier, CreditOutcome};
pub use memory::MemoryLedger;

/// The payment providers coins can be bought through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gateway {
    /// Regional card / mobile-money processor (Paystack)
    CardRegional,
    /// International card processor (Stripe)
    CardInternational,
    /// Mobile-money processor (Chapa)
    MobileMoney,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::CardRegional => "card-regional",
            Gateway::CardInternational => "card-international",
            Gateway::MobileMoney => "mobile-money",
        }
    }

    /// Human-readable provider name used in logs and diagnostics
    pub fn provider_name(&self) -> &'static str {
        match self {
            Gateway::CardRegional => "Paystack",
            Gateway::CardInternational => "Stripe",
            Gateway::MobileMoney => "Chapa",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gateway {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "card-regional" | "paystack" => Ok(Gateway::CardRegional),
            "card-international" | "stripe" => Ok(Gateway::CardInternational),
            "mobile-money" | "chapa" => Ok(Gateway::MobileMoney),
            other => Err(PaymentError::UnsupportedGateway(other.to_string())),
        }
    }
}

/// Identifies one real-world payment across the whole system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub gateway: Gateway,
    pub reference: String,
}

impl IdempotencyKey {
    pub fn new(gateway: Gateway, reference: impl Into<String>) -> Self {
        Self {
            gateway,
            reference: reference.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gateway, self.reference)
    }
}

/// Only successful confirmations are ever recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentRecordStatus {
    Success,
}

impl PaymentRecordStatus {
    pub fn as_str(&self) -> &'static str {
        "success"
    }
}

/// One applied confirmation in a user's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub gateway: Gateway,
    pub reference: String,
    pub coins: u64,
    /// Settlement amount in major units; informational only
    pub gross_amount: Decimal,
    pub currency: Option<String>,
    pub status: PaymentRecordStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PaymentRecord {
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.gateway, self.reference.clone())
    }
}

/// Balance document for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub balance: u64,
    pub history: Vec<PaymentRecord>,
}

impl UserAccount {
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            balance: 0,
            history: Vec::new(),
        }
    }
}

/// Entry of the global `(gateway, reference)` index, kept independently of
/// history so duplicates are still caught if history is ever pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPayment {
    pub key: IdempotencyKey,
    pub user_id: String,
    pub coins: u64,
    pub balance_after: u64,
    pub applied_at: DateTime<Utc>,
}

/// One attempt at an atomic read-modify-write against the ledger.
///
/// Reads observe a consistent snapshot; staged writes become visible all at once
/// on [`commit`](LedgerTransaction::commit) or not at all. Dropping a transaction
/// without committing discards it.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Look up the idempotency index
    async fn find_applied(&mut self, key: &IdempotencyKey) -> DbResult<Option<AppliedPayment>>;

    /// Current balance of `user_id`, 0 when the account does not exist yet
    async fn current_balance(&mut self, user_id: &str) -> DbResult<u64>;

    /// Stage the new balance, the history append and the index entry
    async fn stage_credit(
        &mut self,
        user_id: &str,
        new_balance: u64,
        record: &PaymentRecord,
    ) -> DbResult<()>;

    /// Publish staged writes. Fails with a conflict error when a concurrent
    /// transaction changed the account or claimed the same key first.
    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn LedgerTransaction>>;

    async fn find_account(&self, user_id: &str) -> DbResult<Option<UserAccount>>;

    async fn health_check(&self) -> DbResult<()>;

    /// Backend name reported by the health endpoint
    fn backend(&self) -> &'static str;
}

pub type DynLedgerStore = Arc<dyn LedgerStore>;

/// Open the configured ledger backend, applying migrations for Postgres
pub async fn open_store(config: &LedgerConfig) -> anyhow::Result<DynLedgerStore> {
    match config.backend {
        LedgerBackend::Memory => {
            tracing::warn!("Using the in-memory ledger: balances are lost on restart");
            Ok(Arc::new(MemoryLedger::new()))
        }
        #[cfg(feature = "postgres")]
        LedgerBackend::Postgres => {
            use crate::database::{init_pool, run_migrations, PgLedgerStore, PoolConfig};
            use anyhow::Context;

            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))?;
            let pool_config = PoolConfig::with_max_connections(config.max_connections);
            let pool = init_pool(url, Some(pool_config))
                .await
                .context("Failed to connect to the ledger database")?;
            run_migrations(&pool)
                .await
                .context("Failed to migrate the ledger database")?;
            Ok(Arc::new(PgLedgerStore::new(pool)))
        }
        #[cfg(not(feature = "postgres"))]
        LedgerBackend::Postgres => {
            anyhow::bail!("this build has no postgres support; set LEDGER_BACKEND=memory")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_aliases() {
        assert_eq!("paystack".parse::<Gateway>().unwrap(), Gateway::CardRegional);
        assert_eq!("card-regional".parse::<Gateway>().unwrap(), Gateway::CardRegional);
        assert_eq!("Stripe".parse::<Gateway>().unwrap(), Gateway::CardInternational);
        assert_eq!("mobile-money".parse::<Gateway>().unwrap(), Gateway::MobileMoney);
        assert!(matches!(
            "paypal".parse::<Gateway>(),
            Err(PaymentError::UnsupportedGateway(_))
        ));
    }

    #[test]
    fn test_gateway_serializes_kebab_case() {
        let json = serde_json::to_string(&Gateway::CardInternational).unwrap();
        assert_eq!(json, "\"card-international\"");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = PaymentRecord {
            gateway: Gateway::MobileMoney,
            reference: "coin_1".to_string(),
            coins: 50,
            gross_amount: Decimal::new(12000, 2),
            currency: Some("ETB".to_string()),
            status: PaymentRecordStatus::Success,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["grossAmount"], "120.00");
        assert_eq!(value["status"], "success");
        assert_eq!(value["gateway"], "mobile-money");
    }
}
