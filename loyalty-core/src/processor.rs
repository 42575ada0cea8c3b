//! Transaction processor
//!
//! Runs a purchase or redemption through the pipeline:
//!
//! ```text
//! normalize → cashback rules → limit guard → ledger commit
//!                                               │
//!                          transient failure ───┴──► retry queue
//!                                               │
//!                              success ─────────┴──► commission fan-out
//! ```
//!
//! Validation failures come back as `Err` and are never queued. Transient
//! failures are queued and reported as [`TransactionOutcome::Pending`].

use crate::{
    commission::{CommissionCalculator, CommissionPlan},
    currency::CurrencyNormalizer,
    error::ResolutionExt,
    ledger::Ledger,
    limits::{LimitDecision, LimitGuard},
    partners::PartnerConfigCache,
    queue::RetryQueue,
    referral::ReferralGraph,
    rules::{CashbackEngine, PointsAward},
    types::{
        AccountId, CommissionItem, CommitReceipt, CommitRequest, CurrencyCode, EntryKind,
        PendingOperation, MAX_TRANSACTION_AMOUNT,
    },
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Purchase at a partner
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualRequest {
    /// Idempotency key for the accrual and everything derived from it
    pub operation_id: Uuid,
    /// Buyer
    pub buyer: AccountId,
    /// Seller partner
    pub partner: Option<AccountId>,
    /// Purchase amount as paid
    pub amount: Decimal,
    /// Currency of `amount`
    pub currency: CurrencyCode,
    /// Free text
    pub description: String,
}

impl AccrualRequest {
    /// Purchase with a fresh operation ID
    pub fn new(buyer: AccountId, amount: Decimal, currency: CurrencyCode) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            buyer,
            partner: None,
            amount,
            currency,
            description: String::new(),
        }
    }

    /// Set the seller partner
    pub fn at_partner(mut self, partner: AccountId) -> Self {
        self.partner = Some(partner);
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Use a caller-supplied idempotency key
    pub fn with_operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = operation_id;
        self
    }
}

/// What happened to a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome<T> {
    /// Applied to the ledger
    Committed(T),
    /// Store unavailable; queued for replay
    Pending {
        /// Key of the queued operation
        operation_id: Uuid,
        /// Balance once the queued operation lands, if the current balance could be read
        predicted_balance: Option<Decimal>,
    },
}

impl<T> TransactionOutcome<T> {
    /// Whether the operation was applied immediately
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }
}

/// Result of a committed accrual
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualReceipt {
    /// Ledger receipt; `None` when the purchase earned no points
    pub receipt: Option<CommitReceipt>,
    /// Purchase amount in canonical units
    pub canonical_amount: Decimal,
    /// Rule evaluation breakdown
    pub award: PointsAward,
    /// Commission distribution for the purchase
    pub commission: CommissionPlan,
    /// Commission items credited immediately
    pub commission_credited: usize,
    /// Commission items (and rebate) sent to the retry queue
    pub commission_queued: usize,
}

/// Entry point for purchases and redemptions
pub struct TransactionProcessor {
    ledger: Ledger,
    queue: Arc<RetryQueue>,
    normalizer: CurrencyNormalizer,
    partners: Arc<PartnerConfigCache>,
    cashback: CashbackEngine,
    limits: LimitGuard,
    commission: CommissionCalculator,
    canonical: CurrencyCode,
}

impl std::fmt::Debug for TransactionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionProcessor")
            .field("canonical", &self.canonical)
            .finish_non_exhaustive()
    }
}

/// Stable key for an operation derived from a purchase
fn derived_operation_id(parent: Uuid, label: &str) -> Uuid {
    Uuid::new_v5(&parent, label.as_bytes())
}

fn commission_label(item: &CommissionItem) -> String {
    format!("commission:{:?}:{}", item.tier, item.beneficiary)
}

fn check_amount(what: &str, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidInput(format!("{} must be positive, got {}", what, amount)));
    }
    if amount > MAX_TRANSACTION_AMOUNT {
        return Err(Error::InvalidInput(format!(
            "{} {} exceeds {}",
            what, amount, MAX_TRANSACTION_AMOUNT
        )));
    }
    Ok(())
}

impl TransactionProcessor {
    /// Wire the pipeline over a ledger and its retry queue
    pub fn new(
        ledger: Ledger,
        queue: Arc<RetryQueue>,
        normalizer: CurrencyNormalizer,
        partners: Arc<PartnerConfigCache>,
        canonical: CurrencyCode,
    ) -> Self {
        let registry = ledger.registry().clone();
        let graph = ReferralGraph::new(registry.clone());
        Self {
            cashback: CashbackEngine::new(partners.clone()),
            limits: LimitGuard::new(registry),
            commission: CommissionCalculator::new(graph, partners.source().clone()),
            ledger,
            queue,
            normalizer,
            partners,
            canonical,
        }
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Retry queue
    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    /// Whether `operation_id` already has a ledger receipt. A retry of a
    /// committed operation must not be counted against its own limits.
    fn already_applied(&self, operation_id: Uuid) -> bool {
        matches!(self.ledger.registry().applied_receipt(operation_id), Ok(Some(_)))
    }

    async fn check_limits(
        &self,
        operation_id: Uuid,
        account: &AccountId,
        kind: EntryKind,
        points: Decimal,
        raw_amount: Decimal,
        currency: &CurrencyCode,
    ) -> Result<()> {
        if self.already_applied(operation_id) {
            tracing::debug!(operation_id = %operation_id, "Already committed, skipping limit guard");
            return Ok(());
        }
        let config = self.partners.limits().await.or_fallback("transaction limits");
        let decision = self
            .limits
            .check(&config, account, kind, points, raw_amount, currency, Utc::now())
            .map_err(|e| Error::TransientPersistence(format!("limit history unavailable: {}", e)))?;
        match decision {
            LimitDecision::Allow => Ok(()),
            LimitDecision::Deny { reason } => Err(Error::LimitExceeded(reason)),
        }
    }

    /// Commit, or queue on a transient failure
    async fn commit_or_queue(&self, request: CommitRequest) -> Result<TransactionOutcome<CommitReceipt>> {
        let err = match self.ledger.commit(request.clone()).await {
            Ok(receipt) => return Ok(TransactionOutcome::Committed(receipt)),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        tracing::warn!(
            operation_id = %request.operation_id,
            account_id = %request.account_id,
            error = %err,
            "Commit failed, queueing for retry"
        );
        let op = PendingOperation::from_commit(&request, &err.to_string());
        if let Err(queue_err) = self.queue.enqueue(op).await {
            tracing::error!(
                operation_id = %request.operation_id,
                error = %queue_err,
                "Retry queue unavailable, operation not persisted"
            );
            return Err(err);
        }

        let predicted_balance = self
            .ledger
            .balance(&request.account_id)
            .ok()
            .and_then(|b| b.checked_add(request.canonical_amount));
        Ok(TransactionOutcome::Pending {
            operation_id: request.operation_id,
            predicted_balance,
        })
    }

    /// Credit every item of a plan; failures go to the queue.
    /// Returns (credited, queued).
    ///
    /// With `accrual_pending` nothing is attempted: every item is queued
    /// behind the accrual and is not replayed until the accrual commits.
    async fn fan_out(&self, parent: Uuid, buyer: &AccountId, plan: &CommissionPlan, accrual_pending: bool) -> (usize, usize) {
        let mut credited = 0;
        let mut queued = 0;

        for item in plan.items.iter().filter(|i| i.amount > Decimal::ZERO) {
            let operation_id = derived_operation_id(parent, &commission_label(item));

            let failure = if accrual_pending {
                "accrual pending".to_string()
            } else {
                match self
                    .ledger
                    .credit_commission(operation_id, item.clone(), Some(buyer.clone()))
                    .await
                {
                    Ok(_) => {
                        credited += 1;
                        continue;
                    }
                    Err(e) if e.is_transient() => e.to_string(),
                    Err(e) => {
                        tracing::error!(
                            beneficiary = %item.beneficiary,
                            error = %e,
                            "Commission item rejected"
                        );
                        continue;
                    }
                }
            };

            let mut op = PendingOperation::from_commission(
                operation_id,
                item,
                buyer,
                self.canonical.clone(),
                &failure,
            );
            if accrual_pending {
                op = op.with_parent(parent);
            }
            match self.queue.enqueue(op).await {
                Ok(()) => queued += 1,
                Err(e) => tracing::error!(
                    beneficiary = %item.beneficiary,
                    amount = %item.amount,
                    error = %e,
                    "Commission item lost: retry queue unavailable"
                ),
            }
        }

        if let Some(rebate) = plan.buyer_rebate {
            let request = CommitRequest::new(
                buyer.clone(),
                None,
                EntryKind::AdjustmentOther,
                rebate,
                rebate,
                self.canonical.clone(),
            )
            .with_operation_id(derived_operation_id(parent, "rebate"))
            .with_description("B2B buyer rebate");

            if accrual_pending {
                let op = PendingOperation::from_commit(&request, "accrual pending").with_parent(parent);
                match self.queue.enqueue(op).await {
                    Ok(()) => queued += 1,
                    Err(e) => tracing::error!(error = %e, "Buyer rebate lost: retry queue unavailable"),
                }
            } else {
                match self.commit_or_queue(request).await {
                    Ok(TransactionOutcome::Pending { .. }) => queued += 1,
                    Ok(TransactionOutcome::Committed(_)) => {}
                    Err(e) => tracing::error!(buyer = %buyer, error = %e, "Buyer rebate rejected"),
                }
            }
        }

        (credited, queued)
    }

    /// Process a purchase: earn points and distribute commission
    pub async fn accrue(&self, request: AccrualRequest) -> Result<TransactionOutcome<AccrualReceipt>> {
        check_amount("Purchase amount", request.amount)?;

        let canonical_amount = self
            .normalizer
            .normalize(request.amount, &request.currency, &self.canonical, None)
            .await
            .or_fallback("currency rate");
        check_amount("Normalized purchase amount", canonical_amount)?;

        let award = self
            .cashback
            .points_for(request.partner.as_ref(), canonical_amount, Utc::now())
            .await;

        let commission = self
            .commission
            .calculate(&request.buyer, canonical_amount, request.partner.as_ref())
            .await;

        self.check_limits(
            request.operation_id,
            &request.buyer,
            EntryKind::Accrual,
            award.points,
            request.amount,
            &request.currency,
        )
        .await?;

        if award.points.is_zero() {
            tracing::info!(buyer = %request.buyer, "Purchase earned no points");
            let (commission_credited, commission_queued) =
                self.fan_out(request.operation_id, &request.buyer, &commission, false).await;
            return Ok(TransactionOutcome::Committed(AccrualReceipt {
                receipt: None,
                canonical_amount,
                award,
                commission,
                commission_credited,
                commission_queued,
            }));
        }

        let commit = CommitRequest {
            operation_id: request.operation_id,
            account_id: request.buyer.clone(),
            counterparty_id: request.partner.clone(),
            kind: EntryKind::Accrual,
            canonical_amount: award.points,
            raw_amount: request.amount,
            raw_currency: request.currency.clone(),
            description: request.description.clone(),
        };

        match self.commit_or_queue(commit).await? {
            TransactionOutcome::Committed(receipt) => {
                let (commission_credited, commission_queued) =
                    self.fan_out(request.operation_id, &request.buyer, &commission, false).await;
                Ok(TransactionOutcome::Committed(AccrualReceipt {
                    receipt: Some(receipt),
                    canonical_amount,
                    award,
                    commission,
                    commission_credited,
                    commission_queued,
                }))
            }
            TransactionOutcome::Pending {
                operation_id,
                predicted_balance,
            } => {
                // Store is down: the whole fan-out goes straight to the queue
                self.fan_out(request.operation_id, &request.buyer, &commission, true).await;
                Ok(TransactionOutcome::Pending {
                    operation_id,
                    predicted_balance,
                })
            }
        }
    }

    /// Spend points
    pub async fn redeem(
        &self,
        account: &AccountId,
        points: Decimal,
        description: &str,
        operation_id: Option<Uuid>,
    ) -> Result<TransactionOutcome<CommitReceipt>> {
        check_amount("Redemption", points)?;

        let mut request = CommitRequest::new(
            account.clone(),
            None,
            EntryKind::Redemption,
            -points,
            points,
            self.canonical.clone(),
        )
        .with_description(description);
        if let Some(id) = operation_id {
            request = request.with_operation_id(id);
        }

        self.check_limits(
            request.operation_id,
            account,
            EntryKind::Redemption,
            points,
            points,
            &self.canonical,
        )
        .await?;
        self.commit_or_queue(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, LedgerConfig, QueueConfig};
    use crate::currency::StaticRateTable;
    use crate::limits::{KindLimits, LimitConfig};
    use crate::metrics::Metrics;
    use crate::partners::StaticPartnerConfig;
    use crate::registry::{AccountRegistry, MemoryRegistry};
    use crate::rules::RuleSet;
    use crate::types::{Account, B2BDeal, DealStatus};
    use rust_decimal_macros::dec;

    struct Fixture {
        processor: TransactionProcessor,
        _dir: tempfile::TempDir,
    }

    async fn fixture(partners: StaticPartnerConfig, accounts: &[(&str, Option<&str>, Decimal)]) -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        for (id, parent, balance) in accounts {
            registry
                .open_account(
                    &Account::new(AccountId::new(*id), parent.map(AccountId::new)).with_balance(*balance),
                )
                .unwrap();
        }
        let ledger = Ledger::new(registry, &LedgerConfig::default(), Metrics::new().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            RetryQueue::open(dir.path().join("q.json"), QueueConfig::without_backoff())
                .await
                .unwrap(),
        );
        let normalizer = CurrencyNormalizer::offline(StaticRateTable::new().with_rate("USD", "PTS", dec!(10)));
        let cache = Arc::new(PartnerConfigCache::new(Arc::new(partners), &CacheConfig::default()));
        Fixture {
            processor: TransactionProcessor::new(ledger, queue, normalizer, cache, CurrencyCode::new("PTS")),
            _dir: dir,
        }
    }

    fn committed<T>(outcome: TransactionOutcome<T>) -> T {
        match outcome {
            TransactionOutcome::Committed(value) => value,
            TransactionOutcome::Pending { .. } => panic!("expected a committed outcome"),
        }
    }

    #[tokio::test]
    async fn test_standard_accrual_with_commission() {
        let f = fixture(
            StaticPartnerConfig::new(),
            &[
                ("L2", None, dec!(0)),
                ("L1", Some("L2"), dec!(0)),
                ("B", Some("L1"), dec!(0)),
                ("shop", None, dec!(0)),
            ],
        )
        .await;

        let request = AccrualRequest::new(AccountId::new("B"), dec!(1000), CurrencyCode::new("PTS"))
            .at_partner(AccountId::new("shop"));
        let receipt = committed(f.processor.accrue(request).await.unwrap());

        assert_eq!(receipt.award.points, dec!(50));
        assert_eq!(receipt.receipt.unwrap().new_balance, dec!(50));
        assert_eq!(receipt.commission_credited, 3);

        let ledger = f.processor.ledger();
        assert_eq!(ledger.commission_balance(&AccountId::new("L1")).unwrap(), dec!(2.5));
        assert_eq!(ledger.commission_balance(&AccountId::new("L2")).unwrap(), dec!(2.5));
        assert_eq!(ledger.commission_balance(&AccountId::system()).unwrap(), dec!(45));
        // Commission does not move spendable balances
        assert_eq!(ledger.balance(&AccountId::new("L1")).unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_foreign_currency_is_normalized() {
        let f = fixture(StaticPartnerConfig::new(), &[("B", None, dec!(0))]).await;
        let request = AccrualRequest::new(AccountId::new("B"), dec!(20), CurrencyCode::new("usd"));
        let receipt = committed(f.processor.accrue(request).await.unwrap());

        assert_eq!(receipt.canonical_amount, dec!(200));
        assert_eq!(receipt.award.points, dec!(10));
        let entry = &f.processor.ledger().history(&AccountId::new("B")).unwrap()[0];
        assert_eq!(entry.raw_amount, dec!(20));
        assert_eq!(entry.raw_currency, CurrencyCode::new("USD"));
    }

    #[tokio::test]
    async fn test_b2b_accrual_credits_rebate() {
        let deal = B2BDeal {
            source_partner: AccountId::new("R"),
            target_partner: AccountId::new("S"),
            seller_pays_percent: dec!(10),
            buyer_gets_percent: dec!(15),
            status: DealStatus::Active,
            expires_at: None,
        };
        let f = fixture(
            StaticPartnerConfig::new().with_deal(deal),
            &[("R", None, dec!(0)), ("B", Some("R"), dec!(0))],
        )
        .await;

        let request = AccrualRequest::new(AccountId::new("B"), dec!(1000), CurrencyCode::new("PTS"))
            .at_partner(AccountId::new("S"));
        let receipt = committed(f.processor.accrue(request).await.unwrap());

        let ledger = f.processor.ledger();
        assert_eq!(ledger.commission_balance(&AccountId::new("R")).unwrap(), dec!(70));
        assert_eq!(ledger.commission_balance(&AccountId::system()).unwrap(), dec!(30));
        // 5% cashback plus the 15% rebate
        assert_eq!(receipt.commission.buyer_rebate, Some(dec!(150)));
        assert_eq!(ledger.balance(&AccountId::new("B")).unwrap(), dec!(200));
    }

    #[tokio::test]
    async fn test_repeated_accrual_does_not_double_pay() {
        let f = fixture(
            StaticPartnerConfig::new(),
            &[("L1", None, dec!(0)), ("B", Some("L1"), dec!(0))],
        )
        .await;
        let request = AccrualRequest::new(AccountId::new("B"), dec!(1000), CurrencyCode::new("PTS"));

        f.processor.accrue(request.clone()).await.unwrap();
        let again = committed(f.processor.accrue(request).await.unwrap());

        assert!(again.receipt.unwrap().replayed);
        let ledger = f.processor.ledger();
        assert_eq!(ledger.balance(&AccountId::new("B")).unwrap(), dec!(50));
        assert_eq!(ledger.commission_balance(&AccountId::new("L1")).unwrap(), dec!(2.5));
    }

    #[tokio::test]
    async fn test_retry_of_committed_accrual_is_not_limited() {
        let limits = LimitConfig::default().with_kind(
            EntryKind::Accrual,
            KindLimits {
                max_points_per_day: Some(dec!(50)),
                ..KindLimits::default()
            },
        );
        let f = fixture(StaticPartnerConfig::new().with_limits(limits), &[("B", None, dec!(0))]).await;
        let request = AccrualRequest::new(AccountId::new("B"), dec!(1000), CurrencyCode::new("PTS"));

        committed(f.processor.accrue(request.clone()).await.unwrap());
        let again = committed(f.processor.accrue(request).await.unwrap());
        assert!(again.receipt.unwrap().replayed);

        // A new purchase is still held to the cap
        let fresh = AccrualRequest::new(AccountId::new("B"), dec!(20), CurrencyCode::new("PTS"));
        assert!(matches!(f.processor.accrue(fresh).await, Err(Error::LimitExceeded(_))));
        assert_eq!(f.processor.ledger().balance(&AccountId::new("B")).unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_zero_point_purchase_respects_amount_cap() {
        let rules = RuleSet {
            default_percent: Decimal::ZERO,
            ..RuleSet::default()
        };
        let limits = LimitConfig::default().with_kind(
            EntryKind::Accrual,
            KindLimits {
                max_amount_per_transaction: Some(dec!(100)),
                ..KindLimits::default()
            },
        );
        let f = fixture(
            StaticPartnerConfig::new().with_rules(rules).with_limits(limits),
            &[("L1", None, dec!(0)), ("B", Some("L1"), dec!(0))],
        )
        .await;

        let request = AccrualRequest::new(AccountId::new("B"), dec!(1000), CurrencyCode::new("PTS"));
        assert!(matches!(f.processor.accrue(request).await, Err(Error::LimitExceeded(_))));
        assert_eq!(f.processor.ledger().commission_balance(&AccountId::new("L1")).unwrap(), Decimal::ZERO);
        assert_eq!(f.processor.ledger().commission_balance(&AccountId::system()).unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_oversized_amounts_are_rejected() {
        let f = fixture(StaticPartnerConfig::new(), &[("B", None, dec!(100))]).await;
        let id = AccountId::new("B");

        let huge = AccrualRequest::new(id.clone(), Decimal::MAX / dec!(2), CurrencyCode::new("PTS"));
        assert!(matches!(f.processor.accrue(huge).await, Err(Error::InvalidInput(_))));

        // Within bounds as paid, out of bounds once converted
        let converted = AccrualRequest::new(id.clone(), MAX_TRANSACTION_AMOUNT, CurrencyCode::new("USD"));
        assert!(matches!(f.processor.accrue(converted).await, Err(Error::InvalidInput(_))));

        let redeem = f.processor.redeem(&id, Decimal::MAX, "", None).await;
        assert!(matches!(redeem, Err(Error::InvalidInput(_))));

        // Nothing queued, and the ledger still serves normal traffic
        assert!(f.processor.queue().list_pending().await.is_empty());
        let ok = AccrualRequest::new(id.clone(), dec!(200), CurrencyCode::new("PTS"));
        committed(f.processor.accrue(ok).await.unwrap());
        assert_eq!(f.processor.ledger().balance(&id).unwrap(), dec!(110));
    }

    #[tokio::test]
    async fn test_redeem_and_insufficient_balance() {
        let f = fixture(StaticPartnerConfig::new(), &[("A", None, dec!(100))]).await;
        let id = AccountId::new("A");

        let receipt = committed(f.processor.redeem(&id, dec!(30), "coffee", None).await.unwrap());
        assert_eq!(receipt.new_balance, dec!(70));

        let err = f.processor.redeem(&id, dec!(71), "too much", None).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(f.processor.queue().list_pending().await.is_empty());
        assert_eq!(f.processor.ledger().balance(&id).unwrap(), dec!(70));
    }

    #[tokio::test]
    async fn test_limit_exceeded_is_rejected() {
        let limits = LimitConfig::default().with_kind(
            EntryKind::Redemption,
            KindLimits {
                max_points_per_transaction: Some(dec!(10)),
                ..KindLimits::default()
            },
        );
        let f = fixture(StaticPartnerConfig::new().with_limits(limits), &[("A", None, dec!(100))]).await;

        let err = f
            .processor
            .redeem(&AccountId::new("A"), dec!(11), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LimitExceeded(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_non_positive_purchase_rejected() {
        let f = fixture(StaticPartnerConfig::new(), &[("B", None, dec!(0))]).await;
        let request = AccrualRequest::new(AccountId::new("B"), Decimal::ZERO, CurrencyCode::new("PTS"));
        assert!(matches!(
            f.processor.accrue(request).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
