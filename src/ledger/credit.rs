//! Idempotent coin crediting
//!
//! A confirmation is applied inside a single ledger transaction: look up the
//! `(gateway, reference)` index, and only if it is absent read the balance,
//! add the coins and append the record. A commit that loses a race is retried
//! from scratch, so a concurrent duplicate re-runs the lookup and observes the
//! winner's entry instead of crediting twice.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::error::DatabaseError;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{DynLedgerStore, Gateway, LedgerTransaction};
use crate::payments::types::ConfirmationEvent;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Result of applying a confirmation. Both variants carry the same data so a
/// retried confirmation is indistinguishable from the first one to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied(CreditReceipt),
    Duplicate(CreditReceipt),
}

impl CreditOutcome {
    pub fn receipt(&self) -> &CreditReceipt {
        match self {
            CreditOutcome::Applied(r) | CreditOutcome::Duplicate(r) => r,
        }
    }

    pub fn into_receipt(self) -> CreditReceipt {
        match self {
            CreditOutcome::Applied(r) | CreditOutcome::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreditOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditReceipt {
    pub gateway: Gateway,
    pub reference: String,
    pub user_id: String,
    pub coins: u64,
    pub new_balance: u64,
}

/// Applies Confirmation Events to the ledger exactly once
#[derive(Clone)]
pub struct CreditApplier {
    store: DynLedgerStore,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl CreditApplier {
    pub fn new(store: DynLedgerStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn store(&self) -> &DynLedgerStore {
        &self.store
    }

    pub async fn apply(&self, event: &ConfirmationEvent) -> PaymentResult<CreditOutcome> {
        if event.coins == 0 {
            return Err(PaymentError::MissingMetadata(
                "coins must be greater than zero".to_string(),
            ));
        }
        if event.user_id.trim().is_empty() || event.reference.trim().is_empty() {
            return Err(PaymentError::MissingMetadata(
                "user id and reference are required".to_string(),
            ));
        }

        for attempt in 1..=self.max_attempts {
            match self.try_apply(event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_conflict() => {
                    warn!(
                        key = %event.key(),
                        attempt,
                        max_attempts = self.max_attempts,
                        "ledger conflict while crediting, retrying"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(PaymentError::Store(e)),
            }
        }

        Err(PaymentError::StoreConflict {
            attempts: self.max_attempts,
        })
    }

    /// One transactional attempt. Any error leaves the ledger untouched.
    async fn try_apply(&self, event: &ConfirmationEvent) -> Result<CreditOutcome, DatabaseError> {
        let key = event.key();
        let mut tx = self.store.begin().await?;
        debug!(key = %key, "ledger transaction started");

        if let Some(applied) = tx.find_applied(&key).await? {
            discard(tx).await;
            if applied.user_id != event.user_id {
                warn!(
                    key = %key,
                    recorded_user = %applied.user_id,
                    claimed_user = %event.user_id,
                    "confirmation already applied to a different user"
                );
            }
            info!(
                key = %key,
                user_id = %applied.user_id,
                new_balance = applied.balance_after,
                "duplicate confirmation, ledger unchanged"
            );
            return Ok(CreditOutcome::Duplicate(CreditReceipt {
                gateway: key.gateway,
                reference: key.reference,
                user_id: applied.user_id,
                coins: applied.coins,
                new_balance: applied.balance_after,
            }));
        }

        let current = tx.current_balance(&event.user_id).await?;
        let new_balance = current.checked_add(event.coins).ok_or_else(|| {
            DatabaseError::new(crate::database::error::DatabaseErrorKind::QueryError {
                message: format!("balance overflow for user {}", event.user_id),
            })
        })?;

        let record = event.to_record(Utc::now());
        tx.stage_credit(&event.user_id, new_balance, &record).await?;
        tx.commit().await?;

        info!(
            key = %key,
            user_id = %event.user_id,
            coins = event.coins,
            new_balance,
            "coins credited"
        );

        Ok(CreditOutcome::Applied(CreditReceipt {
            gateway: key.gateway,
            reference: key.reference,
            user_id: event.user_id.clone(),
            coins: event.coins,
            new_balance,
        }))
    }
}

async fn discard(tx: Box<dyn LedgerTransaction>) {
    if let Err(e) = tx.rollback().await {
        debug!(error = %e, "rollback of read-only ledger transaction failed");
    }
}
