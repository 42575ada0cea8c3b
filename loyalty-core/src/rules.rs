//! Cashback rule evaluation
//!
//! Computes the points an accrual earns:
//!
//! ```text
//! points = amount × percent/100 × Π(multipliers) + extra_points
//! ```
//!
//! floored at `min_points` and rounded to cents. The evaluator is a pure
//! function of its inputs; [`CashbackEngine`] feeds it from the cached
//! partner configuration.

use crate::{
    error::{degraded, Resolution, ResolutionExt},
    partners::PartnerConfigCache,
    types::AccountId,
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Hardcoded cashback percent used when no valid rule set is available
pub const DEFAULT_CASHBACK_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Wildcard entry in a bonus rule's partner list
pub const ANY_PARTNER: &str = "*";

/// Rounding applied to the final points value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Toward negative infinity
    Floor,
    /// Toward positive infinity
    Ceil,
    /// Half away from zero
    Round,
    /// Toward zero
    Truncate,
}

impl RoundingMode {
    /// Round to cent precision
    pub fn apply(&self, value: Decimal) -> Decimal {
        let strategy = match self {
            RoundingMode::Floor => RoundingStrategy::ToNegativeInfinity,
            RoundingMode::Ceil => RoundingStrategy::ToPositiveInfinity,
            RoundingMode::Round => RoundingStrategy::MidpointAwayFromZero,
            RoundingMode::Truncate => RoundingStrategy::ToZero,
        };
        value.round_dp_with_strategy(2, strategy)
    }
}

/// Per-partner replacement of the global percent/multiplier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerOverride {
    /// Replaces the global percent
    pub percent: Option<Decimal>,
    /// Replaces the global multiplier
    pub multiplier: Option<Decimal>,
    /// After this instant the override multiplier counts as 1.0
    pub multiplier_expires_at: Option<DateTime<Utc>>,
}

impl PartnerOverride {
    /// Multiplier in force at `now`
    pub fn multiplier_at(&self, now: DateTime<Utc>) -> Option<Decimal> {
        let multiplier = self.multiplier?;
        match self.multiplier_expires_at {
            Some(expiry) if expiry <= now => Some(Decimal::ONE),
            _ => Some(multiplier),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.percent {
            check_percent("override percent", p)?;
        }
        if let Some(m) = self.multiplier {
            if m.is_sign_negative() {
                return Err(format!("override multiplier {} is negative", m));
            }
        }
        Ok(())
    }
}

/// When a bonus rule is live. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindow {
    /// Days of week; empty means every day
    pub days: Vec<Weekday>,
    /// First valid date (inclusive)
    pub start_date: Option<NaiveDate>,
    /// Last valid date (inclusive)
    pub end_date: Option<NaiveDate>,
    /// Start of the daily window (inclusive)
    pub start_time: Option<NaiveTime>,
    /// End of the daily window (exclusive); earlier than `start_time` wraps midnight
    pub end_time: Option<NaiveTime>,
}

impl TimeWindow {
    /// Whether `now` (UTC) falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return false;
        }

        let date = now.date_naive();
        if self.start_date.map_or(false, |start| date < start) {
            return false;
        }
        if self.end_date.map_or(false, |end| date > end) {
            return false;
        }

        let time = now.time();
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start <= end => time >= start && time < end,
            (Some(start), Some(end)) => time >= start || time < end,
            (Some(start), None) => time >= start,
            (None, Some(end)) => time < end,
            (None, None) => true,
        }
    }
}

/// What a matching bonus rule does
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusEffect {
    /// Multiply into the running multiplier
    Multiplier(Decimal),
    /// Add flat points
    ExtraPoints(Decimal),
    /// Replace the computed points outright
    Replace(Decimal),
}

/// Dynamic bonus rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonusRule {
    /// Identifier for audit and logs
    pub id: String,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules never match
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Applicable partners; empty or `"*"` means every partner
    #[serde(default)]
    pub partners: Vec<String>,
    /// Active window
    #[serde(default)]
    pub window: TimeWindow,
    /// Minimum transaction amount (inclusive)
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    /// Maximum transaction amount (inclusive)
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    /// Effect when matched
    pub effect: BonusEffect,
}

fn enabled_default() -> bool {
    true
}

impl BonusRule {
    /// Whether the rule applies to this accrual
    pub fn matches(&self, partner: Option<&AccountId>, amount: Decimal, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let any_partner = self.partners.is_empty() || self.partners.iter().any(|p| p == ANY_PARTNER);
        if !any_partner {
            match partner {
                Some(partner) => {
                    if !self.partners.iter().any(|p| p == partner.as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if self.min_amount.map_or(false, |min| amount < min) {
            return false;
        }
        if self.max_amount.map_or(false, |max| amount > max) {
            return false;
        }

        self.window.contains(now)
    }

    fn validate(&self) -> Result<(), String> {
        match self.effect {
            BonusEffect::Multiplier(m) if m.is_sign_negative() => {
                Err(format!("rule {} has negative multiplier {}", self.id, m))
            }
            BonusEffect::ExtraPoints(p) | BonusEffect::Replace(p) if p.is_sign_negative() => {
                Err(format!("rule {} has negative points {}", self.id, p))
            }
            _ => Ok(()),
        }
    }
}

/// Externally configured cashback rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Global cashback percent (5 means 5 %)
    pub default_percent: Decimal,
    /// Global multiplier
    pub global_multiplier: Decimal,
    /// Final rounding
    pub rounding: RoundingMode,
    /// Floor for any positive accrual
    pub min_points: Decimal,
    /// Per-partner overrides keyed by partner ID
    pub partner_overrides: HashMap<String, PartnerOverride>,
    /// Dynamic bonus rules
    pub bonus_rules: Vec<BonusRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            default_percent: DEFAULT_CASHBACK_PERCENT,
            global_multiplier: Decimal::ONE,
            rounding: RoundingMode::Floor,
            min_points: Decimal::ZERO,
            partner_overrides: HashMap::new(),
            bonus_rules: Vec::new(),
        }
    }
}

fn check_percent(what: &str, p: Decimal) -> Result<(), String> {
    if p.is_sign_negative() || p > Decimal::ONE_HUNDRED {
        return Err(format!("{} {} outside 0..=100", what, p));
    }
    Ok(())
}

impl RuleSet {
    /// Check the rule set for values the evaluator cannot use
    pub fn validate(&self) -> Result<(), String> {
        check_percent("default percent", self.default_percent)?;
        if self.global_multiplier.is_sign_negative() {
            return Err(format!("global multiplier {} is negative", self.global_multiplier));
        }
        if self.min_points.is_sign_negative() {
            return Err(format!("min points {} is negative", self.min_points));
        }
        for (partner, o) in &self.partner_overrides {
            o.validate().map_err(|e| format!("partner {}: {}", partner, e))?;
        }
        for rule in &self.bonus_rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// The rule set if valid, otherwise the hardcoded default
    pub fn validated(self) -> Resolution<RuleSet> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(cause) => degraded(RuleSet::default(), cause),
        }
    }
}

/// Points awarded for one accrual, with the inputs that produced them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsAward {
    /// Final points (rounded)
    pub points: Decimal,
    /// Percent used
    pub percent: Decimal,
    /// Product of all multipliers
    pub multiplier: Decimal,
    /// Flat bonus points added
    pub extra_points: Decimal,
    /// Rule that replaced the computed value, if any
    pub replaced_by: Option<String>,
    /// Bonus rules that matched
    pub applied_rules: Vec<String>,
    /// Whether the min-points floor kicked in
    pub floored: bool,
}

impl PointsAward {
    fn zero(percent: Decimal) -> Self {
        Self {
            points: Decimal::ZERO,
            percent,
            multiplier: Decimal::ONE,
            extra_points: Decimal::ZERO,
            replaced_by: None,
            applied_rules: Vec::new(),
            floored: false,
        }
    }
}

/// Evaluate the rule set for an accrual of `amount` canonical units.
///
/// `override_` takes precedence over the rule set's own entry for the
/// partner. Invalid overrides are ignored.
pub fn evaluate(
    rules: &RuleSet,
    partner: Option<&AccountId>,
    override_: Option<&PartnerOverride>,
    amount: Decimal,
    now: DateTime<Utc>,
) -> PointsAward {
    let override_ = override_
        .or_else(|| partner.and_then(|p| rules.partner_overrides.get(p.as_str())))
        .filter(|o| match o.validate() {
            Ok(()) => true,
            Err(cause) => {
                tracing::warn!(cause = %cause, "Ignoring invalid partner override");
                false
            }
        });

    let percent = override_
        .and_then(|o| o.percent)
        .unwrap_or(rules.default_percent);

    if amount <= Decimal::ZERO {
        return PointsAward::zero(percent);
    }

    let mut multiplier = rules.global_multiplier;
    if let Some(m) = override_.and_then(|o| o.multiplier_at(now)) {
        multiplier = m;
    }

    let mut ordered: Vec<&BonusRule> = rules.bonus_rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut extra_points = Decimal::ZERO;
    let mut replaced: Option<(&str, Decimal)> = None;
    let mut applied_rules = Vec::new();

    for rule in ordered {
        if !rule.matches(partner, amount, now) {
            continue;
        }
        match rule.effect {
            BonusEffect::Multiplier(m) => multiplier = multiplier.saturating_mul(m),
            BonusEffect::ExtraPoints(p) => extra_points = extra_points.saturating_add(p),
            BonusEffect::Replace(p) => {
                if replaced.is_some() {
                    continue;
                }
                replaced = Some((rule.id.as_str(), p));
            }
        }
        applied_rules.push(rule.id.clone());
    }

    let raw = match replaced {
        Some((_, points)) => Some(points),
        None => amount
            .checked_mul(percent)
            .map(|v| v / Decimal::ONE_HUNDRED)
            .and_then(|v| v.checked_mul(multiplier))
            .and_then(|v| v.checked_add(extra_points)),
    };
    let Some(raw) = raw else {
        tracing::warn!(amount = %amount, multiplier = %multiplier, "Points computation overflowed");
        return PointsAward::zero(percent);
    };

    let floored = raw < rules.min_points;
    let points = rules.rounding.apply(raw.max(rules.min_points));

    PointsAward {
        points,
        percent,
        multiplier,
        extra_points,
        replaced_by: replaced.map(|(id, _)| id.to_string()),
        applied_rules,
        floored,
    }
}

/// Rule evaluation over cached partner configuration
#[derive(Clone)]
pub struct CashbackEngine {
    config: Arc<PartnerConfigCache>,
}

impl std::fmt::Debug for CashbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CashbackEngine").finish_non_exhaustive()
    }
}

impl CashbackEngine {
    /// Engine over a config cache
    pub fn new(config: Arc<PartnerConfigCache>) -> Self {
        Self { config }
    }

    /// Points for an accrual at `partner`. Never fails: configuration
    /// problems degrade to the default rule set.
    pub async fn points_for(
        &self,
        partner: Option<&AccountId>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> PointsAward {
        let rules = self.config.rules().await.or_fallback("cashback rules");
        let override_ = match partner {
            Some(p) => self.config.partner_override(p).await.or_fallback("partner override"),
            None => None,
        };

        let award = evaluate(&rules, partner, override_.as_ref(), amount, now);

        tracing::debug!(
            partner = ?partner.map(|p| p.as_str()),
            amount = %amount,
            points = %award.points,
            rules = ?award.applied_rules,
            "Cashback evaluated"
        );

        award
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    // 2024-06-05 was a Wednesday
    fn wednesday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()
    }

    fn rule(id: &str, effect: BonusEffect) -> BonusRule {
        BonusRule {
            id: id.to_string(),
            priority: 0,
            enabled: true,
            partners: vec![],
            window: TimeWindow::default(),
            min_amount: None,
            max_amount: None,
            effect,
        }
    }

    #[test]
    fn test_default_percent() {
        let award = evaluate(&RuleSet::default(), None, None, dec!(200), wednesday_noon());
        assert_eq!(award.points, dec!(10));
        assert_eq!(award.percent, dec!(5));
    }

    #[test]
    fn test_zero_and_negative_amount_yield_zero() {
        let mut rules = RuleSet::default();
        rules.default_percent = dec!(50);
        rules.global_multiplier = dec!(3);
        rules.min_points = dec!(10);
        rules.bonus_rules.push(rule("flat", BonusEffect::ExtraPoints(dec!(5))));

        for amount in [Decimal::ZERO, dec!(-10)] {
            let award = evaluate(&rules, None, None, amount, wednesday_noon());
            assert_eq!(award.points, Decimal::ZERO);
        }
    }

    #[test]
    fn test_rounding_modes() {
        let mut rules = RuleSet::default();
        rules.default_percent = dec!(100);

        let cases = [
            (RoundingMode::Floor, dec!(12.34)),
            (RoundingMode::Ceil, dec!(12.35)),
            (RoundingMode::Round, dec!(12.35)),
            (RoundingMode::Truncate, dec!(12.34)),
        ];
        for (mode, expected) in cases {
            rules.rounding = mode;
            let award = evaluate(&rules, None, None, dec!(12.347), wednesday_noon());
            assert_eq!(award.points, expected, "{:?}", mode);
        }
    }

    #[test]
    fn test_partner_override_and_expiry() {
        let now = wednesday_noon();
        let partner = AccountId::new("cafe");
        let mut rules = RuleSet::default();
        rules.partner_overrides.insert(
            "cafe".to_string(),
            PartnerOverride {
                percent: Some(dec!(10)),
                multiplier: Some(dec!(2)),
                multiplier_expires_at: Some(now + chrono::Duration::days(1)),
            },
        );

        let award = evaluate(&rules, Some(&partner), None, dec!(100), now);
        assert_eq!(award.points, dec!(20));

        // After expiry the multiplier reverts to 1.0 but the percent stays
        let later = now + chrono::Duration::days(2);
        let award = evaluate(&rules, Some(&partner), None, dec!(100), later);
        assert_eq!(award.points, dec!(10));
        assert_eq!(award.multiplier, Decimal::ONE);
    }

    #[test]
    fn test_bonus_rules_combine() {
        let mut rules = RuleSet::default();
        rules.bonus_rules.push(rule("double", BonusEffect::Multiplier(dec!(2))));
        rules.bonus_rules.push(rule("flat", BonusEffect::ExtraPoints(dec!(3))));

        // 100 × 5% × 2 + 3
        let award = evaluate(&rules, None, None, dec!(100), wednesday_noon());
        assert_eq!(award.points, dec!(13));
        assert_eq!(award.applied_rules.len(), 2);
    }

    #[test]
    fn test_replace_rule_highest_priority_wins() {
        let mut rules = RuleSet::default();
        let mut low = rule("low", BonusEffect::Replace(dec!(1)));
        low.priority = 1;
        let mut high = rule("high", BonusEffect::Replace(dec!(50)));
        high.priority = 10;
        rules.bonus_rules = vec![low, high];

        let award = evaluate(&rules, None, None, dec!(100), wednesday_noon());
        assert_eq!(award.points, dec!(50));
        assert_eq!(award.replaced_by.as_deref(), Some("high"));
    }

    #[test]
    fn test_rule_filters() {
        let now = wednesday_noon();
        let partner = AccountId::new("cafe");

        let mut only_cafe = rule("cafe-only", BonusEffect::ExtraPoints(dec!(1)));
        only_cafe.partners = vec!["cafe".to_string()];
        assert!(only_cafe.matches(Some(&partner), dec!(10), now));
        assert!(!only_cafe.matches(Some(&AccountId::new("bar")), dec!(10), now));
        assert!(!only_cafe.matches(None, dec!(10), now));

        let mut wildcard = rule("any", BonusEffect::ExtraPoints(dec!(1)));
        wildcard.partners = vec![ANY_PARTNER.to_string()];
        assert!(wildcard.matches(Some(&AccountId::new("bar")), dec!(10), now));

        let mut big = rule("big", BonusEffect::ExtraPoints(dec!(1)));
        big.min_amount = Some(dec!(100));
        big.max_amount = Some(dec!(500));
        assert!(!big.matches(None, dec!(99), now));
        assert!(big.matches(None, dec!(100), now));
        assert!(!big.matches(None, dec!(501), now));

        let mut weekend = rule("weekend", BonusEffect::ExtraPoints(dec!(1)));
        weekend.window.days = vec![Weekday::Sat, Weekday::Sun];
        assert!(!weekend.matches(None, dec!(10), now));

        let mut disabled = rule("off", BonusEffect::ExtraPoints(dec!(1)));
        disabled.enabled = false;
        assert!(!disabled.matches(None, dec!(10), now));
    }

    #[test]
    fn test_time_window() {
        let now = wednesday_noon();

        let lunch = TimeWindow {
            start_time: NaiveTime::from_hms_opt(11, 0, 0),
            end_time: NaiveTime::from_hms_opt(14, 0, 0),
            ..TimeWindow::default()
        };
        assert!(lunch.contains(now));

        let overnight = TimeWindow {
            start_time: NaiveTime::from_hms_opt(22, 0, 0),
            end_time: NaiveTime::from_hms_opt(6, 0, 0),
            ..TimeWindow::default()
        };
        assert!(!overnight.contains(now));
        assert!(overnight.contains(Utc.with_ymd_and_hms(2024, 6, 5, 23, 30, 0).unwrap()));
        assert!(overnight.contains(Utc.with_ymd_and_hms(2024, 6, 5, 2, 0, 0).unwrap()));

        let june = TimeWindow {
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 5),
            ..TimeWindow::default()
        };
        assert!(june.contains(now));
        assert!(!june.contains(now + chrono::Duration::days(1)));
    }

    #[test]
    fn test_min_points_floor() {
        let mut rules = RuleSet::default();
        rules.min_points = dec!(1);

        let award = evaluate(&rules, None, None, dec!(2), wednesday_noon());
        assert_eq!(award.points, dec!(1));
        assert!(award.floored);
    }

    #[test]
    fn test_overflowing_computation_awards_nothing() {
        let award = evaluate(&RuleSet::default(), None, None, Decimal::MAX / dec!(2), wednesday_noon());
        assert_eq!(award.points, Decimal::ZERO);

        let mut rules = RuleSet::default();
        rules.bonus_rules.push(rule("x1", BonusEffect::Multiplier(Decimal::MAX)));
        rules.bonus_rules.push(rule("x2", BonusEffect::Multiplier(Decimal::MAX)));
        let award = evaluate(&rules, None, None, dec!(1000), wednesday_noon());
        assert_eq!(award.points, Decimal::ZERO);
    }

    #[test]
    fn test_invalid_rule_set_degrades_to_default() {
        let mut rules = RuleSet::default();
        rules.default_percent = dec!(150);

        let degraded = rules.validated().unwrap_err();
        assert_eq!(degraded.default, RuleSet::default());
        assert!(degraded.cause.contains("default percent"));
    }

    #[test]
    fn test_parse_rule_set_toml() {
        let toml = r#"
            default_percent = "2"
            rounding = "round"

            [partner_overrides.cafe]
            percent = "4"

            [[bonus_rules]]
            id = "happy-hour"
            priority = 5
            partners = ["*"]
            effect = { multiplier = "3" }

            [bonus_rules.window]
            days = ["Fri"]
            start_time = "17:00:00"
            end_time = "19:00:00"
        "#;
        let rules: RuleSet = toml::from_str(toml).unwrap();
        assert_eq!(rules.default_percent, dec!(2));
        assert_eq!(rules.rounding, RoundingMode::Round);
        assert_eq!(rules.global_multiplier, Decimal::ONE);
        assert_eq!(rules.bonus_rules[0].effect, BonusEffect::Multiplier(dec!(3)));
        assert_eq!(rules.bonus_rules[0].window.days, vec![Weekday::Fri]);
        assert!(rules.validate().is_ok());
    }
}
