//! Account registry interface
//!
//! The ledger never talks to a concrete database. It writes through
//! [`AccountRegistry`], whose `commit` and `credit_commission` calls must be
//! atomic: either the balance, the history record and the idempotency marker
//! all land, or none of them do.
//!
//! Two implementations ship with the crate: [`crate::storage::Storage`]
//! (RocksDB) and [`MemoryRegistry`] (tests and embedding).

use crate::{
    error::{Error, Result},
    types::{Account, AccountId, CommissionRecord, CommitReceipt, LedgerEntry},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Atomic balance mutation: new account state + history entry + receipt
#[derive(Debug, Clone)]
pub struct BalanceWrite {
    /// Account state after the write (version already bumped)
    pub account: Account,
    /// Version the writer read; the write fails if the store moved on
    pub expected_version: u64,
    /// History record
    pub entry: LedgerEntry,
    /// Receipt stored under the operation ID
    pub receipt: CommitReceipt,
}

/// Atomic commission credit
#[derive(Debug, Clone)]
pub struct CommissionWrite {
    /// Record to persist (carries the new balance)
    pub record: CommissionRecord,
    /// Commission balance the writer read
    pub previous_balance: Decimal,
}

/// Storage seen by the ledger
pub trait AccountRegistry: Send + Sync {
    /// Create an account; fails if the ID is taken
    fn open_account(&self, account: &Account) -> Result<()>;

    /// Fetch an account
    fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Level-1 referrer of an account
    fn referred_by(&self, id: &AccountId) -> Result<Option<AccountId>> {
        Ok(self.get_account(id)?.and_then(|a| a.referred_by))
    }

    /// Receipt of an already-applied commit
    fn applied_receipt(&self, operation_id: Uuid) -> Result<Option<CommitReceipt>>;

    /// Apply a balance mutation atomically
    fn commit(&self, write: &BalanceWrite) -> Result<()>;

    /// Entries for an account at or after `since`, oldest first
    fn entries_since(&self, id: &AccountId, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>>;

    /// Full history for an account, oldest first
    fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.entries_since(id, DateTime::<Utc>::MIN_UTC)
    }

    /// Commission credit already applied under this operation ID
    fn commission_applied(&self, operation_id: Uuid) -> Result<Option<CommissionRecord>>;

    /// Apply a commission credit atomically
    fn credit_commission(&self, write: &CommissionWrite) -> Result<()>;

    /// Commission balance of a beneficiary (zero if never credited)
    fn commission_balance(&self, id: &AccountId) -> Result<Decimal>;

    /// Commission credits of a beneficiary, oldest first
    fn commission_records(&self, id: &AccountId) -> Result<Vec<CommissionRecord>>;
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    entries: HashMap<AccountId, Vec<LedgerEntry>>,
    receipts: HashMap<Uuid, CommitReceipt>,
    commission: HashMap<AccountId, Decimal>,
    commission_log: HashMap<AccountId, Vec<CommissionRecord>>,
    commission_ops: HashMap<Uuid, CommissionRecord>,
}

/// In-memory registry
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry").finish_non_exhaustive()
    }
}

impl MemoryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountRegistry for MemoryRegistry {
    fn open_account(&self, account: &Account) -> Result<()> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(&account.id) {
            return Err(Error::InvalidInput(format!(
                "Account {} already exists",
                account.id
            )));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().accounts.get(id).cloned())
    }

    fn applied_receipt(&self, operation_id: Uuid) -> Result<Option<CommitReceipt>> {
        Ok(self.state.lock().receipts.get(&operation_id).cloned())
    }

    fn commit(&self, write: &BalanceWrite) -> Result<()> {
        let mut state = self.state.lock();

        let found = state
            .accounts
            .get(&write.account.id)
            .map(|a| a.version)
            .ok_or_else(|| Error::AccountNotFound(write.account.id.to_string()))?;
        if found != write.expected_version {
            return Err(Error::VersionConflict {
                account: write.account.id.to_string(),
                expected: write.expected_version,
                found,
            });
        }
        if state.receipts.contains_key(&write.receipt.operation_id) {
            return Err(Error::InvalidInput(format!(
                "Operation {} already applied",
                write.receipt.operation_id
            )));
        }

        state
            .accounts
            .insert(write.account.id.clone(), write.account.clone());
        state
            .entries
            .entry(write.account.id.clone())
            .or_default()
            .push(write.entry.clone());
        state
            .receipts
            .insert(write.receipt.operation_id, write.receipt.clone());
        Ok(())
    }

    fn entries_since(&self, id: &AccountId, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .get(id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commission_applied(&self, operation_id: Uuid) -> Result<Option<CommissionRecord>> {
        Ok(self.state.lock().commission_ops.get(&operation_id).cloned())
    }

    fn credit_commission(&self, write: &CommissionWrite) -> Result<()> {
        let mut state = self.state.lock();
        let beneficiary = write.record.item.beneficiary.clone();

        let current = state
            .commission
            .get(&beneficiary)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if current != write.previous_balance {
            return Err(Error::TransientPersistence(format!(
                "Commission balance of {} moved during write",
                beneficiary
            )));
        }
        if state.commission_ops.contains_key(&write.record.operation_id) {
            return Err(Error::InvalidInput(format!(
                "Operation {} already applied",
                write.record.operation_id
            )));
        }

        state
            .commission
            .insert(beneficiary.clone(), write.record.balance_after);
        state
            .commission_log
            .entry(beneficiary)
            .or_default()
            .push(write.record.clone());
        state
            .commission_ops
            .insert(write.record.operation_id, write.record.clone());
        Ok(())
    }

    fn commission_balance(&self, id: &AccountId) -> Result<Decimal> {
        Ok(self
            .state
            .lock()
            .commission
            .get(id)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn commission_records(&self, id: &AccountId) -> Result<Vec<CommissionRecord>> {
        Ok(self
            .state
            .lock()
            .commission_log
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}
