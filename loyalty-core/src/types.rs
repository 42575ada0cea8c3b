//! Core types for the loyalty ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode in RocksDB, JSON in the retry queue)
//! - Exact arithmetic (Decimal for points and raw amounts)
//!
//! Every amount stored on an [`Account`] or [`LedgerEntry`] is in the
//! canonical points unit; raw amounts keep the currency they arrived in.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reserved beneficiary that receives the platform's share of commissions
pub const SYSTEM_ACCOUNT: &str = "SYSTEM";

/// Largest magnitude a single operation may carry (10^15)
pub const MAX_TRANSACTION_AMOUNT: Decimal = Decimal::from_parts(0xA4C6_8000, 0x0003_8D7E, 0, false, 0);

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The platform sentinel
    pub fn system() -> Self {
        Self(SYSTEM_ACCOUNT.to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the platform sentinel
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ACCOUNT
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Currency code of a raw amount (ISO 4217 or a partner-specific unit)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Create a code, upper-cased
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CurrencyCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// May accrue and redeem
    Active,
    /// Temporarily blocked
    Suspended,
    /// Closed; kept for history
    Closed,
}

/// Loyalty account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Spendable points balance (never negative)
    pub balance: Decimal,

    /// Status
    pub status: AccountStatus,

    /// Level-1 referrer, if any
    pub referred_by: Option<AccountId>,

    /// Incremented on every balance mutation
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// New active account with zero balance
    pub fn new(id: AccountId, referred_by: Option<AccountId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Decimal::ZERO,
            status: AccountStatus::Active,
            referred_by,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an opening balance (onboarding and tests)
    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    /// Whether the account may transact
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Points earned from a purchase
    Accrual = 1,
    /// Points spent
    Redemption = 2,
    /// One-off bonus on enrollment
    EnrollmentBonus = 3,
    /// Commission paid out into the spendable balance
    CommissionPayout = 4,
    /// Manual or rebate adjustment
    AdjustmentOther = 5,
}

impl EntryKind {
    /// Whether the kind removes points from the balance
    pub fn is_debit(&self) -> bool {
        matches!(self, EntryKind::Redemption)
    }

    /// Stable name used in logs and limit configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Accrual => "accrual",
            EntryKind::Redemption => "redemption",
            EntryKind::EnrollmentBonus => "enrollment_bonus",
            EntryKind::CommissionPayout => "commission_payout",
            EntryKind::AdjustmentOther => "adjustment_other",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable ledger history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Idempotency key of the commit that produced this entry
    pub operation_id: Uuid,

    /// Account whose balance changed
    pub account_id: AccountId,

    /// Partner or other party involved
    pub counterparty_id: Option<AccountId>,

    /// Entry timestamp
    pub timestamp: DateTime<Utc>,

    /// Type of entry
    pub kind: EntryKind,

    /// Signed amount in points (negative for redemptions)
    pub canonical_amount: Decimal,

    /// Balance after this entry was applied
    pub balance_after: Decimal,

    /// Amount as received, before normalization
    pub raw_amount: Decimal,

    /// Currency of `raw_amount`
    pub raw_currency: CurrencyCode,

    /// Free text
    pub description: String,
}

impl LedgerEntry {
    /// Points earned by this entry
    pub fn earned(&self) -> Decimal {
        self.canonical_amount.max(Decimal::ZERO)
    }

    /// Points spent by this entry
    pub fn spent(&self) -> Decimal {
        (-self.canonical_amount).max(Decimal::ZERO)
    }
}

/// Request to move an account balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Idempotency key
    pub operation_id: Uuid,
    /// Account to mutate
    pub account_id: AccountId,
    /// Partner or other party
    pub counterparty_id: Option<AccountId>,
    /// Entry kind
    pub kind: EntryKind,
    /// Signed points delta
    pub canonical_amount: Decimal,
    /// Amount as received
    pub raw_amount: Decimal,
    /// Currency of `raw_amount`
    pub raw_currency: CurrencyCode,
    /// Free text
    pub description: String,
}

impl CommitRequest {
    /// Build a request with a fresh operation ID
    pub fn new(
        account_id: AccountId,
        counterparty_id: Option<AccountId>,
        kind: EntryKind,
        canonical_amount: Decimal,
        raw_amount: Decimal,
        raw_currency: CurrencyCode,
    ) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            account_id,
            counterparty_id,
            kind,
            canonical_amount,
            raw_amount,
            raw_currency,
            description: String::new(),
        }
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

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Idempotency key
    pub operation_id: Uuid,
    /// Entry written by the commit
    pub entry_id: Uuid,
    /// Balance after the commit
    pub new_balance: Decimal,
    /// True when the operation had already been applied and nothing changed
    pub replayed: bool,
}

/// Operation waiting in the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Idempotency key, shared with the original attempt
    pub operation_id: Uuid,
    /// Account to mutate (or commission beneficiary)
    pub account_id: AccountId,
    /// Partner or other party
    pub counterparty_id: Option<AccountId>,
    /// Entry kind
    pub kind: EntryKind,
    /// Set when this operation credits a commission balance
    pub commission_tier: Option<CommissionTier>,
    /// Signed points delta
    pub canonical_amount: Decimal,
    /// Amount as received
    pub raw_amount: Decimal,
    /// Currency of `raw_amount`
    pub currency: CurrencyCode,
    /// Free text
    pub description: String,
    /// When the operation first failed
    pub enqueued_at: DateTime<Utc>,
    /// Replay attempts made so far
    pub attempts: u32,
    /// Error from the most recent attempt
    pub last_error: Option<String>,
    /// Not replayed before this time
    pub next_attempt_at: DateTime<Utc>,
    /// Operation that must commit before this one may be replayed
    #[serde(default)]
    pub parent_operation_id: Option<Uuid>,
}

impl PendingOperation {
    /// Queue record for a failed ledger commit
    pub fn from_commit(request: &CommitRequest, error: &str) -> Self {
        let now = Utc::now();
        Self {
            operation_id: request.operation_id,
            account_id: request.account_id.clone(),
            counterparty_id: request.counterparty_id.clone(),
            kind: request.kind,
            commission_tier: None,
            canonical_amount: request.canonical_amount,
            raw_amount: request.raw_amount,
            currency: request.raw_currency.clone(),
            description: request.description.clone(),
            enqueued_at: now,
            attempts: 0,
            last_error: Some(error.to_string()),
            next_attempt_at: now,
            parent_operation_id: None,
        }
    }

    /// Queue record for a failed commission credit
    pub fn from_commission(
        operation_id: Uuid,
        item: &CommissionItem,
        source_account: &AccountId,
        currency: CurrencyCode,
        error: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id,
            account_id: item.beneficiary.clone(),
            counterparty_id: Some(source_account.clone()),
            kind: EntryKind::CommissionPayout,
            commission_tier: Some(item.tier),
            canonical_amount: item.amount,
            raw_amount: item.amount,
            currency,
            description: item.rationale.clone(),
            enqueued_at: now,
            attempts: 0,
            last_error: Some(error.to_string()),
            next_attempt_at: now,
            parent_operation_id: None,
        }
    }

    /// Hold replay until `parent` has committed
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_operation_id = Some(parent);
        self
    }

    /// Rebuild the ledger request this operation stands for
    pub fn to_commit_request(&self) -> CommitRequest {
        CommitRequest {
            operation_id: self.operation_id,
            account_id: self.account_id.clone(),
            counterparty_id: self.counterparty_id.clone(),
            kind: self.kind,
            canonical_amount: self.canonical_amount,
            raw_amount: self.raw_amount,
            raw_currency: self.currency.clone(),
            description: self.description.clone(),
        }
    }

    /// Rebuild the commission item this operation stands for, if any
    pub fn to_commission_item(&self) -> Option<CommissionItem> {
        self.commission_tier.map(|tier| CommissionItem {
            beneficiary: self.account_id.clone(),
            amount: self.canonical_amount,
            tier,
            rationale: self.description.clone(),
        })
    }
}

/// Referrer relationship discovered by walking `referred_by` pointers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEdge {
    /// The account that referred
    pub referrer: AccountId,
    /// The account at the bottom of the chain (the buyer)
    pub referred: AccountId,
    /// Distance from the buyer (1..=3)
    pub level: u8,
}

/// Lifecycle of a bilateral partner deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealStatus {
    /// In force
    Active,
    /// Past its end date
    Expired,
    /// Suspended by either side
    Paused,
}

/// Bilateral override agreement between two partners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct B2BDeal {
    /// Partner that referred the buyer
    pub source_partner: AccountId,
    /// Partner the buyer purchases from
    pub target_partner: AccountId,
    /// Percent of the purchase the seller pays into the fund
    pub seller_pays_percent: Decimal,
    /// Percent of the purchase rebated to the buyer
    pub buyer_gets_percent: Decimal,
    /// Status
    pub status: DealStatus,
    /// Optional end of validity
    pub expires_at: Option<DateTime<Utc>>,
}

impl B2BDeal {
    /// Whether the deal applies at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DealStatus::Active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Recipient class of a commission item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommissionTier {
    /// Level-1 referrer
    L1,
    /// Level-2 referrer
    L2,
    /// Level-3 referrer
    L3,
    /// Platform share in standard and influencer mode
    System,
    /// Partner share under a B2B deal
    B2bPartner,
    /// Platform fee under a B2B deal
    B2bSystemFee,
}

impl CommissionTier {
    /// Tier for a referral level
    pub fn for_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(CommissionTier::L1),
            2 => Some(CommissionTier::L2),
            3 => Some(CommissionTier::L3),
            _ => None,
        }
    }
}

/// One line of a commission distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionItem {
    /// Beneficiary (may be the `SYSTEM` sentinel)
    pub beneficiary: AccountId,
    /// Points credited to the commission balance
    pub amount: Decimal,
    /// Recipient class
    pub tier: CommissionTier,
    /// Why this beneficiary got this amount
    pub rationale: String,
}

/// Persisted commission credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRecord {
    /// Record ID (UUIDv7)
    pub record_id: Uuid,
    /// Idempotency key
    pub operation_id: Uuid,
    /// The credited item
    pub item: CommissionItem,
    /// Buyer whose purchase funded the commission
    pub source_account: Option<AccountId>,
    /// Commission balance after the credit
    pub balance_after: Decimal,
    /// When it was applied
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_system_sentinel() {
        assert!(AccountId::system().is_system());
        assert!(!AccountId::new("alice").is_system());
    }

    #[test]
    fn test_currency_code_normalized() {
        assert_eq!(CurrencyCode::new(" usd ").as_str(), "USD");
    }

    #[test]
    fn test_entry_earned_spent_split() {
        let mut entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            operation_id: Uuid::now_v7(),
            account_id: AccountId::new("A"),
            counterparty_id: None,
            timestamp: Utc::now(),
            kind: EntryKind::Redemption,
            canonical_amount: dec!(-30),
            balance_after: dec!(70),
            raw_amount: dec!(30),
            raw_currency: CurrencyCode::new("PTS"),
            description: String::new(),
        };
        assert_eq!(entry.spent(), dec!(30));
        assert_eq!(entry.earned(), Decimal::ZERO);

        entry.canonical_amount = dec!(12.5);
        assert_eq!(entry.earned(), dec!(12.5));
        assert_eq!(entry.spent(), Decimal::ZERO);
    }

    #[test]
    fn test_deal_expiry() {
        let now = Utc::now();
        let mut deal = B2BDeal {
            source_partner: AccountId::new("R"),
            target_partner: AccountId::new("S"),
            seller_pays_percent: dec!(10),
            buyer_gets_percent: dec!(15),
            status: DealStatus::Active,
            expires_at: None,
        };
        assert!(deal.is_active_at(now));

        deal.expires_at = Some(now - chrono::Duration::hours(1));
        assert!(!deal.is_active_at(now));

        deal.expires_at = None;
        deal.status = DealStatus::Paused;
        assert!(!deal.is_active_at(now));
    }

    #[test]
    fn test_pending_operation_roundtrips_commission_item() {
        let item = CommissionItem {
            beneficiary: AccountId::new("R"),
            amount: dec!(2.5),
            tier: CommissionTier::L1,
            rationale: "L1 share".into(),
        };
        let op = PendingOperation::from_commission(
            Uuid::now_v7(),
            &item,
            &AccountId::new("B"),
            CurrencyCode::new("PTS"),
            "store down",
        );
        assert_eq!(op.kind, EntryKind::CommissionPayout);
        assert_eq!(op.to_commission_item(), Some(item));
    }
}
