//! Main ledger orchestration layer
//!
//! Ties the account registry and the writer actor into the high-level API
//! used by the transaction processor and the retry queue. Writes go through
//! the actor under a timeout; reads go straight to the registry.
//!
//! # Example
//!
//! ```no_run
//! use loyalty_core::{Config, Ledger};
//! use loyalty_core::types::{AccountId, CommitRequest, CurrencyCode, EntryKind};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> loyalty_core::Result<()> {
//!     let ledger = Ledger::open(&Config::default())?;
//!
//!     let request = CommitRequest::new(
//!         AccountId::new("alice"),
//!         None,
//!         EntryKind::Redemption,
//!         Decimal::new(-30, 0),
//!         Decimal::new(30, 0),
//!         CurrencyCode::new("PTS"),
//!     );
//!     let receipt = ledger.commit(request).await?;
//!     println!("new balance {}", receipt.new_balance);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    config::LedgerConfig,
    metrics::Metrics,
    queue::Replayer,
    registry::AccountRegistry,
    storage::Storage,
    types::{
        Account, AccountId, CommissionItem, CommissionRecord, CommitReceipt, CommitRequest,
        LedgerEntry, PendingOperation,
    },
    Config, Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

/// Main ledger interface
#[derive(Clone)]
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct registry access (for reads)
    registry: Arc<dyn AccountRegistry>,

    metrics: Metrics,

    commit_timeout: Duration,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("commit_timeout", &self.commit_timeout)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open a RocksDB-backed ledger under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config)?);
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("metrics: {}", e)))?;
        Ok(Self::new(storage, &config.ledger, metrics))
    }

    /// Ledger over any registry. Must be called inside a Tokio runtime.
    pub fn new(registry: Arc<dyn AccountRegistry>, config: &LedgerConfig, metrics: Metrics) -> Self {
        let handle = spawn_ledger_actor(registry.clone(), config.mailbox_size, metrics.clone());
        Self {
            handle,
            registry,
            metrics,
            commit_timeout: config.commit_timeout(),
        }
    }

    /// Metrics shared with the actor
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Registry the ledger writes to
    pub fn registry(&self) -> &Arc<dyn AccountRegistry> {
        &self.registry
    }

    /// Create an account (onboarding)
    pub fn open_account(&self, account: &Account) -> Result<()> {
        self.registry.open_account(account)
    }

    /// Apply a balance mutation.
    ///
    /// Returns the stored receipt with `replayed = true` if the operation ID
    /// was already applied. A timeout means the outcome is unknown; retrying
    /// with the same operation ID is safe.
    pub async fn commit(&self, request: CommitRequest) -> Result<CommitReceipt> {
        let operation_id = request.operation_id;
        match tokio::time::timeout(self.commit_timeout, self.handle.commit(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation_id = %operation_id, "Commit timed out");
                Err(Error::Timeout(format!(
                    "commit {} exceeded {}ms",
                    operation_id,
                    self.commit_timeout.as_millis()
                )))
            }
        }
    }

    /// Credit one commission item to its beneficiary's commission balance
    pub async fn credit_commission(
        &self,
        operation_id: Uuid,
        item: CommissionItem,
        source_account: Option<AccountId>,
    ) -> Result<CommissionRecord> {
        let credit = self.handle.credit_commission(operation_id, item, source_account);
        match tokio::time::timeout(self.commit_timeout, credit).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "commission credit {} exceeded {}ms",
                operation_id,
                self.commit_timeout.as_millis()
            ))),
        }
    }

    /// Fetch an account
    pub fn account(&self, id: &AccountId) -> Result<Account> {
        self.registry
            .get_account(id)?
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))
    }

    /// Spendable balance
    pub fn balance(&self, id: &AccountId) -> Result<Decimal> {
        Ok(self.account(id)?.balance)
    }

    /// Full history, oldest first
    pub fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.registry.history(id)
    }

    /// Entries at or after `since`, oldest first
    pub fn entries_since(&self, id: &AccountId, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        self.registry.entries_since(id, since)
    }

    /// Commission balance (separate from the spendable balance)
    pub fn commission_balance(&self, id: &AccountId) -> Result<Decimal> {
        self.registry.commission_balance(id)
    }

    /// Commission credits, oldest first
    pub fn commission_records(&self, id: &AccountId) -> Result<Vec<CommissionRecord>> {
        self.registry.commission_records(id)
    }

    /// Stop the writer actor
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[async_trait]
impl Replayer for Ledger {
    async fn replay(&self, op: &PendingOperation) -> Result<()> {
        if let Some(parent) = op.parent_operation_id {
            if self.registry.applied_receipt(parent)?.is_none() {
                return Err(Error::ParentPending(parent));
            }
        }

        match op.to_commission_item() {
            Some(item) => {
                self.credit_commission(op.operation_id, item, op.counterparty_id.clone())
                    .await?;
            }
            None => {
                let receipt = self.commit(op.to_commit_request()).await?;
                if receipt.replayed {
                    tracing::debug!(operation_id = %op.operation_id, "Queued commit had already landed");
                }
            }
        }
        Ok(())
    }
}
