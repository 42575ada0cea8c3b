//! Partner/config store and its TTL cache
//!
//! Rule sets, limit configuration and partner overrides are read-mostly. The
//! cache serves them from memory, refreshes after a TTL and never fails: if
//! the source is unreachable or returns unusable data, callers get the last
//! good value (or the hardcoded default) inside a [`Resolution`] error.

use crate::{
    config::CacheConfig,
    error::{degraded, Resolution},
    limits::LimitConfig,
    rules::{PartnerOverride, RuleSet},
    types::{AccountId, B2BDeal},
    Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// External partner/config store
#[async_trait]
pub trait PartnerConfigSource: Send + Sync {
    /// Global cashback rules
    async fn cashback_rules(&self) -> Result<Option<RuleSet>>;

    /// Transaction caps
    async fn transaction_limits(&self) -> Result<Option<LimitConfig>>;

    /// Override for one partner
    async fn partner_override(&self, partner: &AccountId) -> Result<Option<PartnerOverride>>;

    /// Deal between the buyer's referrer (`source`) and the seller (`target`)
    async fn active_b2b_deal(&self, source: &AccountId, target: &AccountId) -> Result<Option<B2BDeal>>;

    /// Whether a partner is flagged as an influencer
    async fn is_influencer_partner(&self, partner: &AccountId) -> Result<bool>;

    /// Seller's base reward percent for standard commission
    async fn seller_base_reward_percent(&self, seller: &AccountId) -> Result<Option<Decimal>>;

    /// Platform percent used in influencer mode
    async fn platform_influencer_percent(&self) -> Result<Option<Decimal>> {
        Ok(None)
    }
}

/// In-memory partner configuration, loadable from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPartnerConfig {
    /// Cashback rules
    pub rules: Option<RuleSet>,
    /// Transaction caps
    pub limits: Option<LimitConfig>,
    /// Partner overrides keyed by partner ID
    pub overrides: HashMap<String, PartnerOverride>,
    /// Bilateral deals
    pub deals: Vec<B2BDeal>,
    /// Influencer partner IDs
    pub influencers: HashSet<String>,
    /// Base reward percent per seller
    pub seller_percents: HashMap<String, Decimal>,
    /// Influencer-mode platform percent
    pub influencer_percent: Option<Decimal>,
}

impl StaticPartnerConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse partner config: {}", e)))
    }

    /// Set cashback rules
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Set limits
    pub fn with_limits(mut self, limits: LimitConfig) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Add a deal
    pub fn with_deal(mut self, deal: B2BDeal) -> Self {
        self.deals.push(deal);
        self
    }

    /// Flag an influencer
    pub fn with_influencer(mut self, partner: &str) -> Self {
        self.influencers.insert(partner.to_string());
        self
    }

    /// Set a seller's base reward percent
    pub fn with_seller_percent(mut self, seller: &str, percent: Decimal) -> Self {
        self.seller_percents.insert(seller.to_string(), percent);
        self
    }

    /// Set a partner override
    pub fn with_override(mut self, partner: &str, o: PartnerOverride) -> Self {
        self.overrides.insert(partner.to_string(), o);
        self
    }
}

#[async_trait]
impl PartnerConfigSource for StaticPartnerConfig {
    async fn cashback_rules(&self) -> Result<Option<RuleSet>> {
        Ok(self.rules.clone())
    }

    async fn transaction_limits(&self) -> Result<Option<LimitConfig>> {
        Ok(self.limits.clone())
    }

    async fn partner_override(&self, partner: &AccountId) -> Result<Option<PartnerOverride>> {
        Ok(self.overrides.get(partner.as_str()).cloned())
    }

    async fn active_b2b_deal(&self, source: &AccountId, target: &AccountId) -> Result<Option<B2BDeal>> {
        let now = chrono::Utc::now();
        Ok(self
            .deals
            .iter()
            .find(|d| &d.source_partner == source && &d.target_partner == target && d.is_active_at(now))
            .cloned())
    }

    async fn is_influencer_partner(&self, partner: &AccountId) -> Result<bool> {
        Ok(self.influencers.contains(partner.as_str()))
    }

    async fn seller_base_reward_percent(&self, seller: &AccountId) -> Result<Option<Decimal>> {
        Ok(self.seller_percents.get(seller.as_str()).copied())
    }

    async fn platform_influencer_percent(&self) -> Result<Option<Decimal>> {
        Ok(self.influencer_percent)
    }
}

#[derive(Debug)]
struct Cached<T> {
    value: Arc<T>,
    fetched_at: Instant,
}

impl<T> Cached<T> {
    fn new(value: T) -> Self {
        Self {
            value: Arc::new(value),
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// TTL cache in front of a [`PartnerConfigSource`]
pub struct PartnerConfigCache {
    source: Arc<dyn PartnerConfigSource>,
    rules: RwLock<Option<Cached<RuleSet>>>,
    limits: RwLock<Option<Cached<LimitConfig>>>,
    overrides: DashMap<AccountId, Cached<Option<PartnerOverride>>>,
    rules_ttl: Duration,
    limits_ttl: Duration,
    partner_ttl: Duration,
}

impl std::fmt::Debug for PartnerConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartnerConfigCache")
            .field("rules_ttl", &self.rules_ttl)
            .field("limits_ttl", &self.limits_ttl)
            .field("partner_ttl", &self.partner_ttl)
            .finish_non_exhaustive()
    }
}

impl PartnerConfigCache {
    /// Cache over `source` with TTLs from `config`
    pub fn new(source: Arc<dyn PartnerConfigSource>, config: &CacheConfig) -> Self {
        Self {
            source,
            rules: RwLock::new(None),
            limits: RwLock::new(None),
            overrides: DashMap::new(),
            rules_ttl: Duration::from_secs(config.rules_ttl_secs),
            limits_ttl: Duration::from_secs(config.limits_ttl_secs),
            partner_ttl: Duration::from_secs(config.partner_ttl_secs),
        }
    }

    /// Underlying source, for lookups that are not cached
    pub fn source(&self) -> &Arc<dyn PartnerConfigSource> {
        &self.source
    }

    /// Drop every cached value
    pub fn invalidate(&self) {
        *self.rules.write() = None;
        *self.limits.write() = None;
        self.overrides.clear();
    }

    /// Current cashback rules
    pub async fn rules(&self) -> Resolution<Arc<RuleSet>> {
        if let Some(cached) = self.rules.read().as_ref() {
            if cached.is_fresh(self.rules_ttl) {
                return Ok(cached.value.clone());
            }
        }

        let fetched = match self.source.cashback_rules().await {
            Ok(Some(rules)) => rules.validated().map_err(|d| d.cause),
            Ok(None) => Err("no cashback rules configured".to_string()),
            Err(e) => Err(format!("rule source unavailable: {}", e)),
        };

        match fetched {
            Ok(rules) => {
                let cached = Cached::new(rules);
                let value = cached.value.clone();
                *self.rules.write() = Some(cached);
                tracing::debug!("Cashback rules refreshed");
                Ok(value)
            }
            Err(cause) => {
                let last_good = self.rules.read().as_ref().map(|c| c.value.clone());
                degraded(last_good.unwrap_or_else(|| Arc::new(RuleSet::default())), cause)
            }
        }
    }

    /// Current limit configuration; "no limits" when absent
    pub async fn limits(&self) -> Resolution<Arc<LimitConfig>> {
        if let Some(cached) = self.limits.read().as_ref() {
            if cached.is_fresh(self.limits_ttl) {
                return Ok(cached.value.clone());
            }
        }

        let fetched = match self.source.transaction_limits().await {
            Ok(Some(limits)) => limits.validate().map(|_| limits),
            // Absent configuration is a valid "no limit" answer
            Ok(None) => Ok(LimitConfig::default()),
            Err(e) => Err(format!("limit source unavailable: {}", e)),
        };

        match fetched {
            Ok(limits) => {
                let cached = Cached::new(limits);
                let value = cached.value.clone();
                *self.limits.write() = Some(cached);
                Ok(value)
            }
            Err(cause) => {
                let last_good = self.limits.read().as_ref().map(|c| c.value.clone());
                degraded(last_good.unwrap_or_else(|| Arc::new(LimitConfig::default())), cause)
            }
        }
    }

    /// Override for a partner, if any
    pub async fn partner_override(&self, partner: &AccountId) -> Resolution<Option<PartnerOverride>> {
        if let Some(cached) = self.overrides.get(partner) {
            if cached.is_fresh(self.partner_ttl) {
                return Ok(cached.value.as_ref().clone());
            }
        }

        match self.source.partner_override(partner).await {
            Ok(value) => {
                self.overrides.insert(partner.clone(), Cached::new(value.clone()));
                Ok(value)
            }
            Err(e) => {
                let last_good = self
                    .overrides
                    .get(partner)
                    .and_then(|c| c.value.as_ref().clone());
                degraded(last_good, format!("override source unavailable: {}", e))
            }
        }
    }
}
