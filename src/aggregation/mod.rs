//! Aggregation Engine (spec §4.2): one instance per asset pair, orchestrating
//! a bounded fan-out to its feed set and reducing the result to a
//! deterministic statistic.

pub mod stablecoin;

use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::feeds::{FetchError, Fetcher, TradeStreamFetcher};
use crate::model::{Assertion, Method, Sample};
use crate::timestamp::UtcTimestamp;
use stablecoin::{median, resolve_stablecoin_tier};

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("insufficient quorum for {domain}: {got} successful sample(s), need {need}")]
    InsufficientQuorum {
        domain: String,
        got: usize,
        need: usize,
    },
    #[error("system clock failure: {0}")]
    ClockFailure(String),
    #[error("cross-rate denominator was zero in domain {0}")]
    DivisionByZero(String),
}

/// The lower-value-neighbor tie-break median (spec §4.2 step 3, §8 "median
/// tie-break stability"): used for the published value of a direct-median
/// domain and, per step 7, a hybrid domain. Every other median in this module
/// (the USD/stablecoin tier sub-medians, the merged-union median) is a
/// conventional average and uses [`stablecoin::median`] instead.
fn median_direct(values: &mut [Decimal]) -> Decimal {
    values.sort();
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        values[n / 2 - 1]
    }
}

enum DomainKind {
    Median {
        fetchers: Vec<Arc<dyn Fetcher>>,
        min_quorum: usize,
    },
    UsdStablecoin {
        usd_fetchers: Vec<Arc<dyn Fetcher>>,
        stablecoin_fetchers: Vec<Arc<dyn Fetcher>>,
        rate_fetchers: Vec<Arc<dyn Fetcher>>,
        min_quorum: usize,
        divergence_tolerance: Decimal,
    },
    Vwap {
        fetchers: Vec<Arc<dyn TradeStreamFetcher>>,
        min_trade_count: usize,
        min_source_count: usize,
    },
    Cross {
        base: Arc<AggregationEngine>,
        quote: Arc<AggregationEngine>,
    },
    Hybrid {
        direct_fetchers: Vec<Arc<dyn Fetcher>>,
        cross_base: Arc<AggregationEngine>,
        cross_quote: Arc<AggregationEngine>,
        min_quorum: usize,
    },
}

pub struct AggregationEngine {
    domain: String,
    currency: String,
    decimals: u32,
    fetch_deadline: Duration,
    kind: DomainKind,
    nonce_counter: AtomicU64,
}

impl AggregationEngine {
    pub fn direct_median(
        domain: impl Into<String>,
        currency: impl Into<String>,
        decimals: u32,
        fetchers: Vec<Arc<dyn Fetcher>>,
        min_quorum: usize,
        fetch_deadline: Duration,
    ) -> Self {
        AggregationEngine {
            domain: domain.into(),
            currency: currency.into(),
            decimals,
            fetch_deadline,
            kind: DomainKind::Median { fetchers, min_quorum },
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn usd_stablecoin(
        domain: impl Into<String>,
        currency: impl Into<String>,
        decimals: u32,
        usd_fetchers: Vec<Arc<dyn Fetcher>>,
        stablecoin_fetchers: Vec<Arc<dyn Fetcher>>,
        rate_fetchers: Vec<Arc<dyn Fetcher>>,
        min_quorum: usize,
        divergence_tolerance: Decimal,
        fetch_deadline: Duration,
    ) -> Self {
        AggregationEngine {
            domain: domain.into(),
            currency: currency.into(),
            decimals,
            fetch_deadline,
            kind: DomainKind::UsdStablecoin {
                usd_fetchers,
                stablecoin_fetchers,
                rate_fetchers,
                min_quorum,
                divergence_tolerance,
            },
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn vwap(
        domain: impl Into<String>,
        currency: impl Into<String>,
        decimals: u32,
        fetchers: Vec<Arc<dyn TradeStreamFetcher>>,
        min_trade_count: usize,
        min_source_count: usize,
        fetch_deadline: Duration,
    ) -> Self {
        AggregationEngine {
            domain: domain.into(),
            currency: currency.into(),
            decimals,
            fetch_deadline,
            kind: DomainKind::Vwap {
                fetchers,
                min_trade_count,
                min_source_count,
            },
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn cross(
        domain: impl Into<String>,
        currency: impl Into<String>,
        decimals: u32,
        base: Arc<AggregationEngine>,
        quote: Arc<AggregationEngine>,
        fetch_deadline: Duration,
    ) -> Self {
        AggregationEngine {
            domain: domain.into(),
            currency: currency.into(),
            decimals,
            fetch_deadline,
            kind: DomainKind::Cross { base, quote },
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn hybrid(
        domain: impl Into<String>,
        currency: impl Into<String>,
        decimals: u32,
        direct_fetchers: Vec<Arc<dyn Fetcher>>,
        cross_base: Arc<AggregationEngine>,
        cross_quote: Arc<AggregationEngine>,
        min_quorum: usize,
        fetch_deadline: Duration,
    ) -> Self {
        AggregationEngine {
            domain: domain.into(),
            currency: currency.into(),
            decimals,
            fetch_deadline,
            kind: DomainKind::Hybrid {
                direct_fetchers,
                cross_base,
                cross_quote,
                min_quorum,
            },
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub async fn aggregate(&self) -> Result<Assertion, AggregationError> {
        match &self.kind {
            DomainKind::Median { fetchers, min_quorum } => {
                self.aggregate_median(fetchers, *min_quorum).await
            }
            DomainKind::UsdStablecoin {
                usd_fetchers,
                stablecoin_fetchers,
                rate_fetchers,
                min_quorum,
                divergence_tolerance,
            } => {
                self.aggregate_usd_stablecoin(
                    usd_fetchers,
                    stablecoin_fetchers,
                    rate_fetchers,
                    *min_quorum,
                    *divergence_tolerance,
                )
                .await
            }
            DomainKind::Vwap {
                fetchers,
                min_trade_count,
                min_source_count,
            } => {
                self.aggregate_vwap(fetchers, *min_trade_count, *min_source_count)
                    .await
            }
            DomainKind::Cross { base, quote } => self.aggregate_cross(base, quote).await,
            DomainKind::Hybrid {
                direct_fetchers,
                cross_base,
                cross_quote,
                min_quorum,
            } => {
                self.aggregate_hybrid(direct_fetchers, cross_base, cross_quote, *min_quorum)
                    .await
            }
        }
    }

    async fn fetch_all(&self, fetchers: &[Arc<dyn Fetcher>]) -> Vec<Sample> {
        let futs: Vec<_> = fetchers
            .iter()
            .map(|f| {
                let f = Arc::clone(f);
                async move { f.fetch(self.fetch_deadline).await }
            })
            .collect();

        match tokio::time::timeout(self.fetch_deadline, futures::future::join_all(futs)).await {
            Ok(results) => results
                .into_iter()
                .filter_map(|r| match r {
                    Ok(sample) => Some(sample),
                    Err(e) => {
                        tracing::warn!(source_id = e.source_id(), error = %e, "feed fetch failed");
                        None
                    }
                })
                .collect(),
            Err(_) => {
                tracing::warn!(domain = %self.domain, "feed fan-out exceeded total deadline; partial samples discarded");
                Vec::new()
            }
        }
    }

    fn build_assertion(
        &self,
        value: Decimal,
        sources: Vec<String>,
        method: Method,
    ) -> Result<Assertion, AggregationError> {
        let timestamp = UtcTimestamp::try_now().map_err(|e| AggregationError::ClockFailure(e.to_string()))?;
        let nonce = format!("{}-{}", self.domain, self.nonce_counter.fetch_add(1, Ordering::Relaxed));
        Ok(Assertion {
            domain: self.domain.clone(),
            value: value.round_dp(self.decimals),
            currency: self.currency.clone(),
            decimals: self.decimals,
            timestamp,
            nonce,
            sources,
            method,
        })
    }

    async fn aggregate_median(
        &self,
        fetchers: &[Arc<dyn Fetcher>],
        min_quorum: usize,
    ) -> Result<Assertion, AggregationError> {
        let samples = self.fetch_all(fetchers).await;
        if samples.len() < min_quorum {
            return Err(AggregationError::InsufficientQuorum {
                domain: self.domain.clone(),
                got: samples.len(),
                need: min_quorum,
            });
        }
        let mut values: Vec<Decimal> = samples.iter().map(|s| s.value).collect();
        let value = median_direct(&mut values);
        let mut sources: Vec<String> = samples.into_iter().map(|s| s.source_id).collect();
        sources.sort();
        self.build_assertion(value, sources, Method::Median)
    }

    async fn aggregate_usd_stablecoin(
        &self,
        usd_fetchers: &[Arc<dyn Fetcher>],
        stablecoin_fetchers: &[Arc<dyn Fetcher>],
        rate_fetchers: &[Arc<dyn Fetcher>],
        min_quorum: usize,
        divergence_tolerance: Decimal,
    ) -> Result<Assertion, AggregationError> {
        let usd_samples = self.fetch_all(usd_fetchers).await;
        let stablecoin_samples = self.fetch_all(stablecoin_fetchers).await;
        let rate_samples = self.fetch_all(rate_fetchers).await;

        let outcome = resolve_stablecoin_tier(&usd_samples, &stablecoin_samples, &rate_samples, divergence_tolerance);
        if outcome.merged.len() < min_quorum {
            return Err(AggregationError::InsufficientQuorum {
                domain: self.domain.clone(),
                got: outcome.merged.len(),
                need: min_quorum,
            });
        }
        let mut values: Vec<Decimal> = outcome.merged.iter().map(|s| s.value).collect();
        let value = median(&mut values);
        let mut sources: Vec<String> = outcome.merged.into_iter().map(|s| s.source_id).collect();
        sources.sort();
        self.build_assertion(value, sources, Method::Median)
    }

    async fn aggregate_vwap(
        &self,
        fetchers: &[Arc<dyn TradeStreamFetcher>],
        min_trade_count: usize,
        min_source_count: usize,
    ) -> Result<Assertion, AggregationError> {
        let futs: Vec<_> = fetchers
            .iter()
            .map(|f| {
                let f = Arc::clone(f);
                async move { (f.source_id().to_string(), f.fetch_trades(self.fetch_deadline).await) }
            })
            .collect();

        let results: Vec<(String, Result<Vec<(Decimal, Decimal)>, FetchError>)> =
            match tokio::time::timeout(self.fetch_deadline, futures::future::join_all(futs)).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::warn!(domain = %self.domain, "VWAP trade-stream fan-out exceeded deadline");
                    Vec::new()
                }
            };

        let mut pooled: Vec<(Decimal, Decimal)> = Vec::new();
        let mut participating_sources = std::collections::BTreeSet::new();
        for (source_id, result) in results {
            match result {
                Ok(trades) if !trades.is_empty() => {
                    participating_sources.insert(source_id);
                    pooled.extend(trades);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(source_id = %source_id, error = %e, "trade stream fetch failed"),
            }
        }

        if pooled.len() < min_trade_count || participating_sources.len() < min_source_count {
            return Err(AggregationError::InsufficientQuorum {
                domain: self.domain.clone(),
                got: participating_sources.len(),
                need: min_source_count,
            });
        }

        let total_volume: Decimal = pooled.iter().map(|(_, v)| *v).sum();
        if total_volume.is_zero() {
            return Err(AggregationError::InsufficientQuorum {
                domain: self.domain.clone(),
                got: 0,
                need: min_trade_count,
            });
        }
        let weighted_sum: Decimal = pooled.iter().map(|(p, v)| p * v).sum();
        let value = weighted_sum / total_volume;
        self.build_assertion(value, participating_sources.into_iter().collect(), Method::Vwap)
    }

    async fn aggregate_cross(
        &self,
        base: &Arc<AggregationEngine>,
        quote: &Arc<AggregationEngine>,
    ) -> Result<Assertion, AggregationError> {
        let (base_assertion, quote_assertion) = tokio::try_join!(base.aggregate(), quote.aggregate())?;
        if quote_assertion.value.is_zero() {
            return Err(AggregationError::DivisionByZero(self.domain.clone()));
        }
        let value = base_assertion.value / quote_assertion.value;
        let mut sources: std::collections::BTreeSet<String> = base_assertion.sources.into_iter().collect();
        sources.extend(quote_assertion.sources);
        self.build_assertion(value, sources.into_iter().collect(), Method::Cross)
    }

    async fn aggregate_hybrid(
        &self,
        direct_fetchers: &[Arc<dyn Fetcher>],
        cross_base: &Arc<AggregationEngine>,
        cross_quote: &Arc<AggregationEngine>,
        min_quorum: usize,
    ) -> Result<Assertion, AggregationError> {
        let direct_samples = self.fetch_all(direct_fetchers).await;
        let cross_result = tokio::try_join!(cross_base.aggregate(), cross_quote.aggregate());

        let mut values: Vec<Decimal> = direct_samples.iter().map(|s| s.value).collect();
        let mut sources: Vec<String> = direct_samples.into_iter().map(|s| s.source_id).collect();

        if let Ok((base_assertion, quote_assertion)) = cross_result {
            if !quote_assertion.value.is_zero() {
                values.push(base_assertion.value / quote_assertion.value);
                sources.push(format!("cross:{}/{}", base_assertion.domain, quote_assertion.domain));
            }
        }

        if values.len() < min_quorum {
            return Err(AggregationError::InsufficientQuorum {
                domain: self.domain.clone(),
                got: values.len(),
                need: min_quorum,
            });
        }
        let value = median_direct(&mut values);
        sources.sort();
        self.build_assertion(value, sources, Method::Hybrid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::str::FromStr;

    struct FixedFetcher {
        source_id: String,
        value: Decimal,
    }

    #[async_trait]
    impl Fetcher for FixedFetcher {
        fn source_id(&self) -> &str {
            &self.source_id
        }
        async fn fetch(&self, _deadline: Duration) -> Result<Sample, FetchError> {
            Ok(Sample::new(self.source_id.clone(), self.value, UtcTimestamp::from_unix_seconds(0)))
        }
    }

    fn fixed(source_id: &str, value: &str) -> Arc<dyn Fetcher> {
        Arc::new(FixedFetcher {
            source_id: source_id.to_string(),
            value: Decimal::from_str(value).unwrap(),
        })
    }

    struct FailingFetcher(String);

    #[async_trait]
    impl Fetcher for FailingFetcher {
        fn source_id(&self) -> &str {
            &self.0
        }
        async fn fetch(&self, _deadline: Duration) -> Result<Sample, FetchError> {
            Err(FetchError::Transport {
                source_id: self.0.clone(),
                detail: "connection refused".to_string(),
            })
        }
    }

    struct FixedTradeStream {
        source_id: String,
        trades: Vec<(Decimal, Decimal)>,
    }

    #[async_trait]
    impl TradeStreamFetcher for FixedTradeStream {
        fn source_id(&self) -> &str {
            &self.source_id
        }
        async fn fetch_trades(&self, _deadline: Duration) -> Result<Vec<(Decimal, Decimal)>, FetchError> {
            Ok(self.trades.clone())
        }
    }

    #[tokio::test]
    async fn direct_median_odd_count_picks_middle_element() {
        let engine = AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "69001.00"), fixed("b", "69010.00"), fixed("c", "69003.00")],
            2,
            Duration::from_secs(3),
        );
        let assertion = engine.aggregate().await.unwrap();
        assert_eq!(assertion.value, Decimal::from_str("69003.00").unwrap());
        assert_eq!(assertion.sources, vec!["a", "b", "c"]);
        assert_eq!(assertion.method, Method::Median);
    }

    #[tokio::test]
    async fn direct_median_even_count_uses_lower_neighbor_regardless_of_permutation() {
        let ascending = AggregationEngine::direct_median(
            "D",
            "USD",
            0,
            vec![fixed("a", "1"), fixed("b", "2"), fixed("c", "3"), fixed("d", "4")],
            4,
            Duration::from_secs(3),
        );
        let descending = AggregationEngine::direct_median(
            "D",
            "USD",
            0,
            vec![fixed("d", "4"), fixed("c", "3"), fixed("b", "2"), fixed("a", "1")],
            4,
            Duration::from_secs(3),
        );
        let a = ascending.aggregate().await.unwrap();
        let b = descending.aggregate().await.unwrap();
        assert_eq!(a.value, Decimal::from(2));
        assert_eq!(a.value, b.value);
    }

    #[tokio::test]
    async fn below_quorum_fails_never_returns_a_value() {
        let engine = AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "69001.00"), Arc::new(FailingFetcher("b".to_string()))],
            2,
            Duration::from_secs(3),
        );
        let result = engine.aggregate().await;
        assert!(matches!(result, Err(AggregationError::InsufficientQuorum { .. })));
    }

    #[tokio::test]
    async fn vwap_pools_trades_across_sources() {
        let engine = AggregationEngine::vwap(
            "BTCUSD-VWAP",
            "USD",
            2,
            vec![Arc::new(FixedTradeStream {
                source_id: "pool".to_string(),
                trades: vec![
                    (Decimal::from(100), Decimal::from(2)),
                    (Decimal::from(101), Decimal::from(3)),
                    (Decimal::from(99), Decimal::from(5)),
                ],
            })],
            1,
            1,
            Duration::from_secs(3),
        );
        let assertion = engine.aggregate().await.unwrap();
        assert_eq!(assertion.value, Decimal::from_str("99.80").unwrap());
        assert_eq!(assertion.method, Method::Vwap);
    }

    #[tokio::test]
    async fn cross_rate_divides_base_by_quote_and_unions_sources() {
        let base = Arc::new(AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "60000.00")],
            1,
            Duration::from_secs(3),
        ));
        let quote = Arc::new(AggregationEngine::direct_median(
            "EURUSD",
            "USD",
            5,
            vec![fixed("b", "1.10000")],
            1,
            Duration::from_secs(3),
        ));
        let cross = AggregationEngine::cross("BTCEUR", "EUR", 2, base, quote, Duration::from_secs(3));
        let assertion = cross.aggregate().await.unwrap();
        assert_eq!(assertion.value, Decimal::from_str("54545.45").unwrap());
        assert_eq!(assertion.method, Method::Cross);
        assert_eq!(assertion.sources, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn hybrid_uses_cross_rate_as_a_synthetic_source_alongside_direct_feeds() {
        let cross_base = Arc::new(AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "60100.00")],
            1,
            Duration::from_secs(3),
        ));
        let cross_quote = Arc::new(AggregationEngine::direct_median(
            "EURUSD",
            "USD",
            5,
            vec![fixed("b", "1.00000")],
            1,
            Duration::from_secs(3),
        ));
        let engine = AggregationEngine::hybrid(
            "BTCEUR",
            "EUR",
            2,
            vec![fixed("d1", "60000.00")],
            cross_base,
            cross_quote,
            2,
            Duration::from_secs(3),
        );
        let assertion = engine.aggregate().await.unwrap();
        assert_eq!(assertion.method, Method::Hybrid);
        assert_eq!(assertion.value, Decimal::from_str("60000.00").unwrap());
        assert_eq!(assertion.sources, vec!["cross:BTCUSD/EURUSD", "d1"]);
    }

    #[tokio::test]
    async fn hybrid_falls_back_to_direct_sources_when_the_cross_denominator_is_zero() {
        let cross_base = Arc::new(AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "60100.00")],
            1,
            Duration::from_secs(3),
        ));
        let cross_quote = Arc::new(AggregationEngine::direct_median(
            "EURUSD",
            "USD",
            5,
            vec![fixed("b", "0.00000")],
            1,
            Duration::from_secs(3),
        ));
        let engine = AggregationEngine::hybrid(
            "BTCEUR",
            "EUR",
            2,
            vec![fixed("d1", "60000.00")],
            cross_base,
            cross_quote,
            1,
            Duration::from_secs(3),
        );
        let assertion = engine.aggregate().await.unwrap();
        assert_eq!(assertion.sources, vec!["d1"]);
    }

    #[tokio::test]
    async fn stablecoin_tier_dropped_when_divergence_exceeds_tolerance() {
        let engine = AggregationEngine::usd_stablecoin(
            "BTCUSD",
            "USD",
            2,
            vec![fixed("a", "100.00"), fixed("b", "100.10")],
            vec![fixed("x", "99.00")],
            vec![fixed("r1", "1.00"), fixed("r2", "1.00")],
            2,
            Decimal::from_str("0.005").unwrap(),
            Duration::from_secs(3),
        );
        let assertion = engine.aggregate().await.unwrap();
        assert_eq!(assertion.value, Decimal::from_str("100.05").unwrap());
        assert_eq!(assertion.sources, vec!["a", "b"]);
    }
}
