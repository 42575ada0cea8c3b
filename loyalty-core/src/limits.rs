//! Transaction limit checking
//!
//! Caps are configured per entry kind. A missing cap means "no limit".
//! Daily totals are summed from the account's ledger history for the
//! current UTC day. Raw amounts are only comparable within one currency, so
//! the daily amount cap counts entries in the operation's currency.

use crate::{
    registry::AccountRegistry,
    types::{AccountId, CurrencyCode, EntryKind},
    Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Caps for one entry kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindLimits {
    /// Points allowed in a single operation
    pub max_points_per_transaction: Option<Decimal>,
    /// Raw amount allowed in a single operation
    pub max_amount_per_transaction: Option<Decimal>,
    /// Points allowed per UTC day
    pub max_points_per_day: Option<Decimal>,
    /// Raw amount allowed per UTC day, per currency
    pub max_amount_per_day: Option<Decimal>,
}

/// Limit configuration keyed by entry kind name (`accrual`, `redemption`, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Caps per kind
    pub kinds: HashMap<String, KindLimits>,
}

impl LimitConfig {
    /// Caps for a kind, if configured
    pub fn for_kind(&self, kind: EntryKind) -> Option<&KindLimits> {
        self.kinds.get(kind.as_str())
    }

    /// Set caps for a kind (builder style)
    pub fn with_kind(mut self, kind: EntryKind, limits: KindLimits) -> Self {
        self.kinds.insert(kind.as_str().to_string(), limits);
        self
    }

    /// Check the configuration for unusable values
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (kind, limits) in &self.kinds {
            let caps = [
                limits.max_points_per_transaction,
                limits.max_amount_per_transaction,
                limits.max_points_per_day,
                limits.max_amount_per_day,
            ];
            if caps.iter().flatten().any(|c| c.is_sign_negative()) {
                return Err(format!("negative cap for {}", kind));
            }
        }
        Ok(())
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    /// Within every cap
    Allow,
    /// Over a cap
    Deny {
        /// Human-readable reason
        reason: String,
    },
}

impl LimitDecision {
    /// Whether the operation may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allow)
    }
}

/// Today's usage for one account and kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyUsage {
    /// Points moved today
    pub points: Decimal,
    /// Raw amount moved today in the requested currency
    pub amount: Decimal,
}

/// Limit checker
#[derive(Clone)]
pub struct LimitGuard {
    registry: Arc<dyn AccountRegistry>,
}

impl std::fmt::Debug for LimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitGuard").finish_non_exhaustive()
    }
}

impl LimitGuard {
    /// Create new limit guard over ledger history
    pub fn new(registry: Arc<dyn AccountRegistry>) -> Self {
        Self { registry }
    }

    /// Sum today's committed points for `account` and `kind`, and the raw
    /// amount of those entries paid in `currency`
    pub fn daily_usage(
        &self,
        account: &AccountId,
        kind: EntryKind,
        currency: &CurrencyCode,
        now: DateTime<Utc>,
    ) -> Result<DailyUsage> {
        let start_of_day = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);

        let usage = self
            .registry
            .entries_since(account, start_of_day)?
            .into_iter()
            .filter(|e| e.kind == kind && e.timestamp <= now)
            .fold(DailyUsage::default(), |acc, e| DailyUsage {
                points: acc.points.saturating_add(e.canonical_amount.abs()),
                amount: if &e.raw_currency == currency {
                    acc.amount.saturating_add(e.raw_amount.abs())
                } else {
                    acc.amount
                },
            });
        Ok(usage)
    }

    /// Check a proposed operation against the configured caps.
    ///
    /// `points` and `raw_amount` are magnitudes; the sign is ignored.
    /// `raw_amount` is in `currency`.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &self,
        config: &LimitConfig,
        account: &AccountId,
        kind: EntryKind,
        points: Decimal,
        raw_amount: Decimal,
        currency: &CurrencyCode,
        now: DateTime<Utc>,
    ) -> Result<LimitDecision> {
        let Some(limits) = config.for_kind(kind) else {
            return Ok(LimitDecision::Allow);
        };
        let points = points.abs();
        let raw_amount = raw_amount.abs();

        if let Some(max) = limits.max_points_per_transaction {
            if points > max {
                return Ok(deny(format!(
                    "{} of {} points exceeds per-transaction limit {}",
                    kind, points, max
                )));
            }
        }
        if let Some(max) = limits.max_amount_per_transaction {
            if raw_amount > max {
                return Ok(deny(format!(
                    "{} amount {} exceeds per-transaction limit {}",
                    kind, raw_amount, max
                )));
            }
        }

        if limits.max_points_per_day.is_none() && limits.max_amount_per_day.is_none() {
            return Ok(LimitDecision::Allow);
        }

        let usage = self.daily_usage(account, kind, currency, now)?;

        if let Some(max) = limits.max_points_per_day {
            if usage.points.saturating_add(points) > max {
                return Ok(deny(format!(
                    "daily {} points limit {} would be exceeded ({} used, {} requested)",
                    kind, max, usage.points, points
                )));
            }
        }
        if let Some(max) = limits.max_amount_per_day {
            if usage.amount.saturating_add(raw_amount) > max {
                return Ok(deny(format!(
                    "daily {} amount limit {} would be exceeded ({} used, {} requested)",
                    kind, max, usage.amount, raw_amount
                )));
            }
        }

        Ok(LimitDecision::Allow)
    }
}

fn deny(reason: String) -> LimitDecision {
    tracing::info!(reason = %reason, "Limit guard denied operation");
    LimitDecision::Deny { reason }
}
