//! In-process ledger backend
//!
//! Used for local development (`LEDGER_BACKEND=memory`) and as the store in
//! tests. Transactions are optimistic: every account version and every absent
//! idempotency key a transaction reads is re-checked under the write lock at
//! commit, and the commit is refused with a conflict if any of them changed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::ledger::{
    AppliedPayment, IdempotencyKey, LedgerStore, LedgerTransaction, PaymentRecord, UserAccount,
};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, VersionedAccount>,
    applied: HashMap<IdempotencyKey, AppliedPayment>,
}

#[derive(Debug, Clone)]
struct VersionedAccount {
    account: UserAccount,
    version: u64,
}

#[derive(Debug, Default)]
struct FaultInjection {
    conflicts: AtomicU32,
    outages: AtomicU32,
}

impl FaultInjection {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    faults: Arc<FaultInjection>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail as if a concurrent writer had won
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.faults.conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail as if the store were unreachable
    pub fn inject_commit_outages(&self, n: u32) {
        self.faults.outages.store(n, Ordering::SeqCst);
    }

    /// Number of entries in the idempotency index
    pub async fn applied_count(&self) -> usize {
        self.state.read().await.applied.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> DbResult<Box<dyn LedgerTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            read_versions: HashMap::new(),
            absent_keys: Vec::new(),
            staged: None,
        }))
    }

    async fn find_account(&self, user_id: &str) -> DbResult<Option<UserAccount>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(user_id).map(|v| v.account.clone()))
    }

    async fn health_check(&self) -> DbResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct StagedCredit {
    user_id: String,
    new_balance: u64,
    record: PaymentRecord,
}

struct MemoryTransaction {
    state: Arc<RwLock<LedgerState>>,
    faults: Arc<FaultInjection>,
    /// Account versions observed by this transaction; 0 means "did not exist"
    read_versions: HashMap<String, u64>,
    /// Keys this transaction saw as not yet applied
    absent_keys: Vec<IdempotencyKey>,
    staged: Option<StagedCredit>,
}

impl MemoryTransaction {
    fn version_of(state: &LedgerState, user_id: &str) -> u64 {
        state.accounts.get(user_id).map(|a| a.version).unwrap_or(0)
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn find_applied(&mut self, key: &IdempotencyKey) -> DbResult<Option<AppliedPayment>> {
        let state = self.state.read().await;
        match state.applied.get(key) {
            Some(applied) => Ok(Some(applied.clone())),
            None => {
                self.absent_keys.push(key.clone());
                Ok(None)
            }
        }
    }

    async fn current_balance(&mut self, user_id: &str) -> DbResult<u64> {
        let state = self.state.read().await;
        let (balance, version) = match state.accounts.get(user_id) {
            Some(entry) => (entry.account.balance, entry.version),
            None => (0, 0),
        };
        self.read_versions.entry(user_id.to_string()).or_insert(version);
        Ok(balance)
    }

    async fn stage_credit(
        &mut self,
        user_id: &str,
        new_balance: u64,
        record: &PaymentRecord,
    ) -> DbResult<()> {
        if self.staged.is_some() {
            return Err(DatabaseError::new(DatabaseErrorKind::TransactionError {
                message: "only one credit may be staged per transaction".to_string(),
            }));
        }

        if !self.read_versions.contains_key(user_id) {
            let state = self.state.read().await;
            let version = Self::version_of(&state, user_id);
            self.read_versions.insert(user_id.to_string(), version);
        }
        self.absent_keys.push(record.key());

        self.staged = Some(StagedCredit {
            user_id: user_id.to_string(),
            new_balance,
            record: record.clone(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let MemoryTransaction {
            state,
            faults,
            read_versions,
            absent_keys,
            staged,
        } = *self;

        if FaultInjection::take(&faults.outages) {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "injected outage".to_string(),
            }));
        }
        if FaultInjection::take(&faults.conflicts) {
            return Err(DatabaseError::conflict("injected conflict"));
        }

        let mut state = state.write().await;

        for (user_id, seen) in &read_versions {
            if Self::version_of(&state, user_id) != *seen {
                return Err(DatabaseError::conflict(format!(
                    "account {} changed since it was read",
                    user_id
                )));
            }
        }
        for key in &absent_keys {
            if state.applied.contains_key(key) {
                return Err(DatabaseError::conflict(format!(
                    "{} was applied concurrently",
                    key
                )));
            }
        }

        let Some(staged) = staged else {
            return Ok(());
        };

        let entry = state
            .accounts
            .entry(staged.user_id.clone())
            .or_insert_with(|| VersionedAccount {
                account: UserAccount::empty(staged.user_id.clone()),
                version: 0,
            });
        entry.account.balance = staged.new_balance;
        entry.account.history.push(staged.record.clone());
        entry.version += 1;

        let key = staged.record.key();
        state.applied.insert(
            key.clone(),
            AppliedPayment {
                key,
                user_id: staged.user_id,
                coins: staged.record.coins,
                balance_after: staged.new_balance,
                applied_at: staged.record.timestamp,
            },
        );

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Gateway, PaymentRecordStatus};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn record(reference: &str, coins: u64) -> PaymentRecord {
        PaymentRecord {
            gateway: Gateway::MobileMoney,
            reference: reference.to_string(),
            coins,
            gross_amount: Decimal::ZERO,
            currency: None,
            status: PaymentRecordStatus::Success,
            timestamp: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_invisible() {
        let ledger = MemoryLedger::new();
        let mut tx = ledger.begin().await.unwrap();
        tx.current_balance("u1").await.unwrap();
        tx.stage_credit("u1", 10, &record("r1", 10)).await.unwrap();
        drop(tx);

        assert!(ledger.find_account("u1").await.unwrap().is_none());
        assert_eq!(ledger.applied_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_read_conflicts_on_commit() {
        let ledger = MemoryLedger::new();

        let mut slow = ledger.begin().await.unwrap();
        assert_eq!(slow.current_balance("u1").await.unwrap(), 0);

        let mut fast = ledger.begin().await.unwrap();
        fast.current_balance("u1").await.unwrap();
        fast.stage_credit("u1", 5, &record("fast", 5)).await.unwrap();
        fast.commit().await.unwrap();

        slow.stage_credit("u1", 7, &record("slow", 7)).await.unwrap();
        let err = slow.commit().await.unwrap_err();
        assert!(err.is_conflict());

        let account = ledger.find_account("u1").await.unwrap().unwrap();
        assert_eq!(account.balance, 5);
        assert_eq!(account.history.len(), 1);
    }

    #[tokio::test]
    async fn test_key_claimed_by_other_user_conflicts() {
        let ledger = MemoryLedger::new();
        let key = IdempotencyKey::new(Gateway::MobileMoney, "shared");

        let mut a = ledger.begin().await.unwrap();
        assert!(a.find_applied(&key).await.unwrap().is_none());
        a.current_balance("alice").await.unwrap();

        let mut b = ledger.begin().await.unwrap();
        b.current_balance("bob").await.unwrap();
        b.stage_credit("bob", 3, &record("shared", 3)).await.unwrap();
        b.commit().await.unwrap();

        a.stage_credit("alice", 3, &record("shared", 3)).await.unwrap();
        assert!(a.commit().await.unwrap_err().is_conflict());
        assert!(ledger.find_account("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_outage_applies_nothing() {
        let ledger = MemoryLedger::new();
        ledger.inject_commit_outages(1);

        let mut tx = ledger.begin().await.unwrap();
        tx.current_balance("u1").await.unwrap();
        tx.stage_credit("u1", 10, &record("r1", 10)).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(!err.is_conflict());
        assert!(err.is_retryable());

        assert!(ledger.find_account("u1").await.unwrap().is_none());
        assert_eq!(ledger.applied_count().await, 0);
    }
}
