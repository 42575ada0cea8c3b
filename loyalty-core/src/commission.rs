//! Commission distribution
//!
//! A purchase funds a commission pool that is split between the buyer's
//! referrers and the platform. Three modes, first match wins:
//!
//! | Mode       | Trigger                                   | Fund                      | Split                  |
//! |------------|-------------------------------------------|---------------------------|------------------------|
//! | B2B        | L1 has an active deal with the seller     | amount × seller_pays      | L1 70 %, system 30 %   |
//! | Influencer | L1 is an influencer partner               | amount × platform percent | L1 70 %, system 30 %   |
//! | Standard   | otherwise                                 | amount × seller percent   | 5 % per level, rest system |
//!
//! Under a B2B deal the buyer additionally gets `amount × buyer_gets` as a
//! rebate, outside the fund.
//!
//! Resolution of the inputs is async and never fails ([`CommissionCalculator`]);
//! the split itself is the pure function [`distribute`].

use crate::{
    error::{degraded, ResolutionExt},
    partners::PartnerConfigSource,
    referral::{ReferralChain, ReferralGraph, MAX_REFERRAL_DEPTH},
    types::{AccountId, B2BDeal, CommissionItem, CommissionTier},
};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Seller reward percent when none is configured
pub const DEFAULT_SELLER_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Platform percent in influencer mode when none is configured
pub const DEFAULT_INFLUENCER_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Share of the fund each present referral level receives (percent)
pub const LEVEL_SHARE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Partner share in B2B and influencer mode (percent)
pub const PARTNER_SHARE_PERCENT: Decimal = Decimal::from_parts(70, 0, 0, false, 0);

/// Which distribution rule applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionMode {
    /// Bilateral deal between L1 and seller
    B2bOverride,
    /// L1 is an influencer
    Influencer,
    /// Multi-level referral split
    Standard,
}

/// Inputs to a distribution, already resolved
#[derive(Debug, Clone, PartialEq)]
pub struct CommissionContext {
    /// Buyer's referrers
    pub chain: ReferralChain,
    /// Seller partner of the purchase
    pub seller: Option<AccountId>,
    /// Active deal between L1 and the seller
    pub b2b_deal: Option<B2BDeal>,
    /// Whether L1 is an influencer partner
    pub l1_is_influencer: bool,
    /// Seller's base reward percent
    pub seller_percent: Decimal,
    /// Platform percent for influencer mode
    pub influencer_percent: Decimal,
}

impl Default for CommissionContext {
    fn default() -> Self {
        Self {
            chain: ReferralChain::default(),
            seller: None,
            b2b_deal: None,
            l1_is_influencer: false,
            seller_percent: DEFAULT_SELLER_PERCENT,
            influencer_percent: DEFAULT_INFLUENCER_PERCENT,
        }
    }
}

/// Result of a distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionPlan {
    /// Rule that applied
    pub mode: CommissionMode,
    /// Total commission pool
    pub fund: Decimal,
    /// Credits; sum equals `fund`
    pub items: Vec<CommissionItem>,
    /// Extra credit for the buyer under a B2B deal
    pub buyer_rebate: Option<Decimal>,
}

impl CommissionPlan {
    /// Sum of all items
    pub fn total(&self) -> Decimal {
        self.items.iter().map(|i| i.amount).sum()
    }

    /// Item for a beneficiary, if any
    pub fn item_for(&self, beneficiary: &AccountId) -> Option<&CommissionItem> {
        self.items.iter().find(|i| &i.beneficiary == beneficiary)
    }
}

fn cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `percent` is clamped to 0..=100, so the result never exceeds `amount`
fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    let percent = percent.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
    amount
        .checked_mul(percent)
        .map(|v| v / Decimal::ONE_HUNDRED)
        .unwrap_or_else(|| amount / Decimal::ONE_HUNDRED * percent)
}

/// Split a purchase of `amount` according to `ctx`.
///
/// Every share is rounded half-up to cents and the platform item takes the
/// remainder, so `plan.total() == plan.fund`. A non-positive amount yields an
/// empty plan.
pub fn distribute(ctx: &CommissionContext, amount: Decimal) -> CommissionPlan {
    let now = Utc::now();
    let l1 = ctx.chain.l1();
    let deal = ctx
        .b2b_deal
        .as_ref()
        .filter(|d| {
            l1.map_or(false, |l1| &d.source_partner == l1)
                && ctx.seller.as_ref().map_or(false, |s| &d.target_partner == s)
                && d.is_active_at(now)
        });

    let mode = match (deal, l1) {
        (Some(_), Some(_)) => CommissionMode::B2bOverride,
        (None, Some(_)) if ctx.l1_is_influencer => CommissionMode::Influencer,
        _ => CommissionMode::Standard,
    };

    if amount <= Decimal::ZERO {
        return CommissionPlan {
            mode,
            fund: Decimal::ZERO,
            items: Vec::new(),
            buyer_rebate: None,
        };
    }

    let mut items = Vec::new();
    let mut buyer_rebate = None;

    let fund = match (mode, deal, l1) {
        (CommissionMode::B2bOverride, Some(deal), Some(l1)) => {
            let fund = cents(percent_of(amount, deal.seller_pays_percent));
            let partner = cents(percent_of(fund, PARTNER_SHARE_PERCENT));
            items.push(CommissionItem {
                beneficiary: l1.clone(),
                amount: partner,
                tier: CommissionTier::B2bPartner,
                rationale: format!(
                    "B2B deal with {}: {}% of {}% seller fund",
                    deal.target_partner, PARTNER_SHARE_PERCENT, deal.seller_pays_percent
                ),
            });
            items.push(CommissionItem {
                beneficiary: AccountId::system(),
                amount: fund - partner,
                tier: CommissionTier::B2bSystemFee,
                rationale: "B2B platform fee".to_string(),
            });
            let rebate = cents(percent_of(amount, deal.buyer_gets_percent));
            if rebate > Decimal::ZERO {
                buyer_rebate = Some(rebate);
            }
            fund
        }
        (CommissionMode::Influencer, _, Some(l1)) => {
            let fund = cents(percent_of(amount, ctx.influencer_percent));
            let partner = cents(percent_of(fund, PARTNER_SHARE_PERCENT));
            items.push(CommissionItem {
                beneficiary: l1.clone(),
                amount: partner,
                tier: CommissionTier::L1,
                rationale: format!("Influencer share: {}% of fund", PARTNER_SHARE_PERCENT),
            });
            items.push(CommissionItem {
                beneficiary: AccountId::system(),
                amount: fund - partner,
                tier: CommissionTier::System,
                rationale: "Influencer mode platform share".to_string(),
            });
            fund
        }
        _ => {
            let fund = cents(percent_of(amount, ctx.seller_percent));
            let level_share = cents(percent_of(fund, LEVEL_SHARE_PERCENT));
            let mut paid = Decimal::ZERO;
            for level in 1..=MAX_REFERRAL_DEPTH {
                let (Some(referrer), Some(tier)) =
                    (ctx.chain.at_level(level), CommissionTier::for_level(level))
                else {
                    continue;
                };
                items.push(CommissionItem {
                    beneficiary: referrer.clone(),
                    amount: level_share,
                    tier,
                    rationale: format!("Level {} referral: {}% of fund", level, LEVEL_SHARE_PERCENT),
                });
                paid += level_share;
            }
            items.push(CommissionItem {
                beneficiary: AccountId::system(),
                amount: fund - paid,
                tier: CommissionTier::System,
                rationale: format!(
                    "Platform residual ({} of {} levels present)",
                    items.len(),
                    MAX_REFERRAL_DEPTH
                ),
            });
            fund
        }
    };

    CommissionPlan {
        mode,
        fund,
        items,
        buyer_rebate,
    }
}

/// Resolves a [`CommissionContext`] from the referral graph and partner
/// configuration, then distributes
#[derive(Clone)]
pub struct CommissionCalculator {
    graph: ReferralGraph,
    partners: Arc<dyn PartnerConfigSource>,
}

impl std::fmt::Debug for CommissionCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommissionCalculator")
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

impl CommissionCalculator {
    /// Create new calculator
    pub fn new(graph: ReferralGraph, partners: Arc<dyn PartnerConfigSource>) -> Self {
        Self { graph, partners }
    }

    /// Gather the inputs for a purchase. Every lookup falls back to a safe
    /// default on error.
    pub async fn resolve_context(
        &self,
        buyer: &AccountId,
        seller: Option<&AccountId>,
    ) -> CommissionContext {
        let chain = self.graph.chain(buyer);
        let l1 = chain.l1().cloned();

        let b2b_deal = match (&l1, seller) {
            (Some(l1), Some(seller)) => match self.partners.active_b2b_deal(l1, seller).await {
                Ok(deal) => deal,
                Err(e) => degraded(None, format!("deal lookup failed: {}", e)).or_fallback("b2b deal"),
            },
            _ => None,
        };

        let l1_is_influencer = match &l1 {
            Some(l1) if b2b_deal.is_none() => match self.partners.is_influencer_partner(l1).await {
                Ok(flag) => flag,
                Err(e) => degraded(false, format!("influencer lookup failed: {}", e))
                    .or_fallback("influencer flag"),
            },
            _ => false,
        };

        let seller_percent = match seller {
            Some(seller) => {
                let fetched = self.partners.seller_base_reward_percent(seller).await;
                resolve_percent(fetched, DEFAULT_SELLER_PERCENT, "seller reward percent")
            }
            None => DEFAULT_SELLER_PERCENT,
        };

        let influencer_percent = if l1_is_influencer {
            let fetched = self.partners.platform_influencer_percent().await;
            resolve_percent(fetched, DEFAULT_INFLUENCER_PERCENT, "influencer percent")
        } else {
            DEFAULT_INFLUENCER_PERCENT
        };

        CommissionContext {
            chain,
            seller: seller.cloned(),
            b2b_deal,
            l1_is_influencer,
            seller_percent,
            influencer_percent,
        }
    }

    /// Commission plan for a purchase. Never fails.
    pub async fn calculate(
        &self,
        buyer: &AccountId,
        amount: Decimal,
        seller: Option<&AccountId>,
    ) -> CommissionPlan {
        let ctx = self.resolve_context(buyer, seller).await;
        let plan = distribute(&ctx, amount);

        tracing::debug!(
            buyer = %buyer,
            mode = ?plan.mode,
            fund = %plan.fund,
            items = plan.items.len(),
            "Commission calculated"
        );

        plan
    }
}

fn resolve_percent(fetched: crate::Result<Option<Decimal>>, default: Decimal, what: &str) -> Decimal {
    let resolution = match fetched {
        Ok(Some(p)) if !p.is_sign_negative() && p <= Decimal::ONE_HUNDRED => Ok(p),
        Ok(Some(p)) => degraded(default, format!("{} out of range", p)),
        Ok(None) => Ok(default),
        Err(e) => degraded(default, format!("lookup failed: {}", e)),
    };
    resolution.or_fallback(what)
}
