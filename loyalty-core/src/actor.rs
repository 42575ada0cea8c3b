//! Actor-based concurrency for the ledger
//!
//! All balance mutations go through one Tokio task:
//! - One logical writer per ledger, so read-check-write sequences on an
//!   account cannot interleave
//! - Bounded mailbox gives callers backpressure
//! - The registry's version check catches any writer outside this actor
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        TransactionProcessor / RetryQueue drain        │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │   validate → receipt lookup → balance check →        │
//! │   AccountRegistry::commit (one atomic write)          │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::{
    metrics::Metrics,
    registry::{AccountRegistry, BalanceWrite, CommissionWrite},
    types::{
        AccountId, CommissionItem, CommissionRecord, CommitReceipt, CommitRequest, EntryKind,
        LedgerEntry, MAX_TRANSACTION_AMOUNT,
    },
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Apply a balance mutation
    Commit {
        request: CommitRequest,
        response: oneshot::Sender<Result<CommitReceipt>>,
    },

    /// Credit a commission balance
    CreditCommission {
        operation_id: Uuid,
        item: CommissionItem,
        source_account: Option<AccountId>,
        response: oneshot::Sender<Result<CommissionRecord>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    /// Storage backend
    registry: Arc<dyn AccountRegistry>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    metrics: Metrics,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor").finish_non_exhaustive()
    }
}

/// Reject requests the ledger must never apply
pub fn validate_request(request: &CommitRequest) -> Result<()> {
    if request.canonical_amount.is_zero() {
        return Err(Error::InvalidInput(format!(
            "Operation {} has zero amount",
            request.operation_id
        )));
    }
    if request.canonical_amount.abs() > MAX_TRANSACTION_AMOUNT {
        return Err(Error::InvalidInput(format!(
            "Operation {} amount {} exceeds {}",
            request.operation_id, request.canonical_amount, MAX_TRANSACTION_AMOUNT
        )));
    }
    let negative = request.canonical_amount.is_sign_negative();
    if request.kind.is_debit() != negative {
        return Err(Error::InvalidInput(format!(
            "{} amount {} has the wrong sign",
            request.kind, request.canonical_amount
        )));
    }
    if request.account_id.is_system() {
        return Err(Error::InvalidInput(
            "SYSTEM has no spendable balance".to_string(),
        ));
    }
    Ok(())
}

/// Persistence failures reach callers as transient errors
fn transient(err: Error) -> Error {
    match err {
        Error::Storage(msg) | Error::Serialization(msg) | Error::Other(msg) => {
            Error::TransientPersistence(msg)
        }
        Error::Io(e) => Error::TransientPersistence(e.to_string()),
        other => other,
    }
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        mailbox: mpsc::Receiver<LedgerMessage>,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            mailbox,
            metrics,
        }
    }

    /// Run the actor event loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => {
                    tracing::info!("Ledger actor shutting down");
                    break;
                }
                LedgerMessage::Commit { request, response } => {
                    let result = self.commit(&request);
                    let _ = response.send(result);
                }
                LedgerMessage::CreditCommission {
                    operation_id,
                    item,
                    source_account,
                    response,
                } => {
                    let result = self.credit_commission(operation_id, &item, source_account);
                    let _ = response.send(result);
                }
            }
        }
    }

    fn commit(&self, request: &CommitRequest) -> Result<CommitReceipt> {
        let started = Instant::now();

        if let Err(e) = validate_request(request) {
            self.metrics.record_rejection();
            return Err(e);
        }

        if let Some(mut receipt) = self
            .registry
            .applied_receipt(request.operation_id)
            .map_err(transient)?
        {
            tracing::debug!(operation_id = %request.operation_id, "Commit already applied");
            receipt.replayed = true;
            return Ok(receipt);
        }

        let mut account = self
            .registry
            .get_account(&request.account_id)
            .map_err(transient)?
            .ok_or_else(|| Error::AccountNotFound(request.account_id.to_string()))
            .map_err(|e| {
                self.metrics.record_rejection();
                e
            })?;

        if !account.is_active() {
            self.metrics.record_rejection();
            return Err(Error::AccountInactive(account.id.to_string()));
        }

        let Some(new_balance) = account.balance.checked_add(request.canonical_amount) else {
            self.metrics.record_rejection();
            return Err(Error::InvalidInput(format!(
                "Balance of {} would overflow",
                account.id
            )));
        };
        if new_balance < Decimal::ZERO {
            self.metrics.record_rejection();
            return Err(Error::InsufficientBalance {
                account: account.id.to_string(),
                balance: account.balance,
                requested: -request.canonical_amount,
            });
        }

        let now = Utc::now();
        let expected_version = account.version;
        account.balance = new_balance;
        account.version += 1;
        account.updated_at = now;

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            operation_id: request.operation_id,
            account_id: account.id.clone(),
            counterparty_id: request.counterparty_id.clone(),
            timestamp: now,
            kind: request.kind,
            canonical_amount: request.canonical_amount,
            balance_after: new_balance,
            raw_amount: request.raw_amount,
            raw_currency: request.raw_currency.clone(),
            description: request.description.clone(),
        };
        let receipt = CommitReceipt {
            operation_id: request.operation_id,
            entry_id: entry.entry_id,
            new_balance,
            replayed: false,
        };

        self.registry
            .commit(&BalanceWrite {
                account,
                expected_version,
                entry,
                receipt: receipt.clone(),
            })
            .map_err(transient)?;

        self.metrics.record_commit(started.elapsed().as_secs_f64());
        tracing::info!(
            account_id = %request.account_id,
            operation_id = %request.operation_id,
            kind = %request.kind,
            amount = %request.canonical_amount,
            new_balance = %new_balance,
            "Commit applied"
        );

        Ok(receipt)
    }

    fn credit_commission(
        &self,
        operation_id: Uuid,
        item: &CommissionItem,
        source_account: Option<AccountId>,
    ) -> Result<CommissionRecord> {
        if item.amount <= Decimal::ZERO || item.amount > MAX_TRANSACTION_AMOUNT {
            return Err(Error::InvalidInput(format!(
                "Commission for {} out of range: {}",
                item.beneficiary, item.amount
            )));
        }

        if let Some(record) = self
            .registry
            .commission_applied(operation_id)
            .map_err(transient)?
        {
            tracing::debug!(operation_id = %operation_id, "Commission already credited");
            return Ok(record);
        }

        let previous_balance = self
            .registry
            .commission_balance(&item.beneficiary)
            .map_err(transient)?;

        let balance_after = previous_balance.checked_add(item.amount).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Commission balance of {} would overflow",
                item.beneficiary
            ))
        })?;

        let record = CommissionRecord {
            record_id: Uuid::now_v7(),
            operation_id,
            item: item.clone(),
            source_account,
            balance_after,
            timestamp: Utc::now(),
        };

        self.registry
            .credit_commission(&CommissionWrite {
                record: record.clone(),
                previous_balance,
            })
            .map_err(transient)?;

        self.metrics.record_commission_credit();
        tracing::info!(
            beneficiary = %item.beneficiary,
            tier = ?item.tier,
            amount = %item.amount,
            "Commission credited"
        );

        Ok(record)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn send(&self, msg: LedgerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))
    }

    /// Apply a balance mutation
    pub async fn commit(&self, request: CommitRequest) -> Result<CommitReceipt> {
        let (tx, rx) = oneshot::channel();
        self.send(LedgerMessage::Commit {
            request,
            response: tx,
        })
        .await?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Credit a commission balance
    pub async fn credit_commission(
        &self,
        operation_id: Uuid,
        item: CommissionItem,
        source_account: Option<AccountId>,
    ) -> Result<CommissionRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(LedgerMessage::CreditCommission {
            operation_id,
            item,
            source_account,
            response: tx,
        })
        .await?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.send(LedgerMessage::Shutdown).await
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    registry: Arc<dyn AccountRegistry>,
    mailbox_size: usize,
    metrics: Metrics,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));
    let actor = LedgerActor::new(registry, rx, metrics);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
