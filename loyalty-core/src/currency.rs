//! Currency normalization into the canonical points unit
//!
//! Rates come from an external [`RateProvider`]. When the provider is down,
//! slow, or does not know the pair, the normalizer falls back to a static
//! table and finally to the identity rate. That permissive fallback is part of
//! the contract: an accrual is never refused because a rate was unavailable.

use crate::{
    error::{degraded, Resolution},
    types::CurrencyCode,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// External exchange-rate source
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Rate converting one unit of `from` into `to`; `None` if the pair is unknown
    async fn get_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        as_of: Option<NaiveDate>,
    ) -> crate::Result<Option<Decimal>>;
}

/// Fixed rate table
#[derive(Debug, Clone, Default)]
pub struct StaticRateTable {
    rates: HashMap<(CurrencyCode, CurrencyCode), Decimal>,
}

impl StaticRateTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rate (builder style)
    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.insert(CurrencyCode::new(from), CurrencyCode::new(to), rate);
        self
    }

    /// Add a rate
    pub fn insert(&mut self, from: CurrencyCode, to: CurrencyCode, rate: Decimal) {
        self.rates.insert((from, to), rate);
    }

    /// Look up a pair, trying the inverse when only that is known
    pub fn lookup(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<Decimal> {
        if let Some(rate) = self.rates.get(&(from.clone(), to.clone())) {
            return Some(*rate);
        }
        self.rates
            .get(&(to.clone(), from.clone()))
            .filter(|r| !r.is_zero())
            .map(|r| Decimal::ONE / *r)
    }
}

#[async_trait]
impl RateProvider for StaticRateTable {
    async fn get_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        _as_of: Option<NaiveDate>,
    ) -> crate::Result<Option<Decimal>> {
        Ok(self.lookup(from, to))
    }
}

/// Converts raw amounts into the canonical unit
#[derive(Clone)]
pub struct CurrencyNormalizer {
    provider: Option<Arc<dyn RateProvider>>,
    fallback: StaticRateTable,
    lookup_timeout: Duration,
}

impl std::fmt::Debug for CurrencyNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrencyNormalizer")
            .field("has_provider", &self.provider.is_some())
            .field("fallback", &self.fallback)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish()
    }
}

impl CurrencyNormalizer {
    /// Normalizer backed by a live provider and a static fallback table
    pub fn new(
        provider: Arc<dyn RateProvider>,
        fallback: StaticRateTable,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            provider: Some(provider),
            fallback,
            lookup_timeout,
        }
    }

    /// Normalizer that only uses the static table
    pub fn offline(fallback: StaticRateTable) -> Self {
        Self {
            provider: None,
            fallback,
            lookup_timeout: Duration::ZERO,
        }
    }

    /// Convert `amount` from `from` into `to`.
    ///
    /// `Err` carries the amount converted at the best rate that could be
    /// found (static table, or identity) and the reason the live rate was not
    /// used.
    pub async fn normalize(
        &self,
        amount: Decimal,
        from: &CurrencyCode,
        to: &CurrencyCode,
        as_of: Option<NaiveDate>,
    ) -> Resolution<Decimal> {
        if from == to {
            return Ok(amount);
        }

        let live = match &self.provider {
            Some(provider) => {
                match tokio::time::timeout(self.lookup_timeout, provider.get_rate(from, to, as_of))
                    .await
                {
                    Ok(Ok(Some(rate))) if rate > Decimal::ZERO => Ok(rate),
                    Ok(Ok(Some(rate))) => Err(format!("provider returned non-positive rate {}", rate)),
                    Ok(Ok(None)) => Err(format!("provider does not know {}/{}", from, to)),
                    Ok(Err(e)) => Err(format!("provider unavailable: {}", e)),
                    Err(_) => Err(format!(
                        "provider timed out after {}ms",
                        self.lookup_timeout.as_millis()
                    )),
                }
            }
            None => Err("no live rate provider".to_string()),
        };

        let cause = match live {
            Ok(rate) => return Ok(amount.saturating_mul(rate)),
            Err(cause) => cause,
        };

        match self.fallback.lookup(from, to) {
            Some(rate) => degraded(amount.saturating_mul(rate), format!("{}; used static rate {}", cause, rate)),
            None => {
                tracing::warn!(
                    from = %from,
                    to = %to,
                    cause = %cause,
                    "No rate for currency pair, using identity"
                );
                degraded(amount, format!("{}; no static rate, used identity", cause))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionExt;
    use crate::Error;
    use rust_decimal_macros::dec;

    struct DownProvider;

    #[async_trait]
    impl RateProvider for DownProvider {
        async fn get_rate(
            &self,
            _from: &CurrencyCode,
            _to: &CurrencyCode,
            _as_of: Option<NaiveDate>,
        ) -> crate::Result<Option<Decimal>> {
            Err(Error::Other("connection refused".into()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl RateProvider for SlowProvider {
        async fn get_rate(
            &self,
            _from: &CurrencyCode,
            _to: &CurrencyCode,
            _as_of: Option<NaiveDate>,
        ) -> crate::Result<Option<Decimal>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(dec!(100)))
        }
    }

    fn usd() -> CurrencyCode {
        CurrencyCode::new("USD")
    }

    fn pts() -> CurrencyCode {
        CurrencyCode::new("PTS")
    }

    #[tokio::test]
    async fn test_same_currency_is_identity() {
        let normalizer = CurrencyNormalizer::offline(StaticRateTable::new());
        let result = normalizer.normalize(dec!(42.5), &pts(), &pts(), None).await;
        assert_eq!(result.unwrap(), dec!(42.5));
    }

    #[tokio::test]
    async fn test_live_rate_used() {
        let live = StaticRateTable::new().with_rate("USD", "PTS", dec!(10));
        let normalizer = CurrencyNormalizer::new(
            Arc::new(live),
            StaticRateTable::new(),
            Duration::from_millis(100),
        );
        let result = normalizer.normalize(dec!(3), &usd(), &pts(), None).await;
        assert_eq!(result.unwrap(), dec!(30));
    }

    #[tokio::test]
    async fn test_inverse_rate() {
        let table = StaticRateTable::new().with_rate("PTS", "USD", dec!(0.5));
        assert_eq!(table.lookup(&usd(), &pts()), Some(dec!(2)));
    }

    #[tokio::test]
    async fn test_provider_down_uses_static_table() {
        let normalizer = CurrencyNormalizer::new(
            Arc::new(DownProvider),
            StaticRateTable::new().with_rate("USD", "PTS", dec!(10)),
            Duration::from_millis(100),
        );
        let result = normalizer.normalize(dec!(3), &usd(), &pts(), None).await;
        let degraded = result.unwrap_err();
        assert_eq!(degraded.default, dec!(30));
        assert!(degraded.cause.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unknown_pair_falls_back_to_identity() {
        let normalizer = CurrencyNormalizer::new(
            Arc::new(DownProvider),
            StaticRateTable::new(),
            Duration::from_millis(100),
        );
        let amount = normalizer
            .normalize(dec!(7), &CurrencyCode::new("XYZ"), &pts(), None)
            .await
            .or_fallback("fx");
        assert_eq!(amount, dec!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let normalizer = CurrencyNormalizer::new(
            Arc::new(SlowProvider),
            StaticRateTable::new(),
            Duration::from_millis(50),
        );
        let degraded = normalizer
            .normalize(dec!(2), &usd(), &pts(), None)
            .await
            .unwrap_err();
        assert_eq!(degraded.default, dec!(2));
        assert!(degraded.cause.contains("timed out"));
    }
}
