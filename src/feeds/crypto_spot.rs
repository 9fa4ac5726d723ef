//! Crypto spot fetchers (spec §4.1): GET a last-trade/ticker endpoint, decode
//! a known JSON shape, return the last price. USDT-quoted venues report in
//! their native quote currency — normalization to USD happens upstream in
//! the Aggregation Engine (spec §4.2 step 4), not here.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use super::{FetchError, Fetcher};
use crate::model::Sample;
use crate::timestamp::UtcTimestamp;

/// The quote currency a venue reports its last-trade price in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteTier {
    Usd,
    Usdt,
}

/// A JSON-over-HTTP last-trade fetcher, configured per-venue.
///
/// Every crypto-spot source follows the same shape — GET an endpoint, pull a
/// price out of the body with a JSON pointer, optionally pull a volume the
/// same way — so rather than hand-writing one struct per exchange this is a
/// single generic adapter constructed once per venue (see the `binance_*` /
/// `coinbase_*` / `kraken_*` constructors below).
pub struct CryptoSpotFetcher {
    source_id: String,
    url: String,
    client: reqwest::Client,
    price_pointer: &'static str,
    volume_pointer: Option<&'static str>,
    pub quote_tier: QuoteTier,
}

impl CryptoSpotFetcher {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        price_pointer: &'static str,
        quote_tier: QuoteTier,
    ) -> Self {
        CryptoSpotFetcher {
            source_id: source_id.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            price_pointer,
            volume_pointer: None,
            quote_tier,
        }
    }

    pub fn with_volume_pointer(mut self, pointer: &'static str) -> Self {
        self.volume_pointer = Some(pointer);
        self
    }

    pub fn binance(source_id: &str, symbol: &str, quote_tier: QuoteTier) -> Self {
        CryptoSpotFetcher::new(
            source_id,
            format!("https://api.binance.com/api/v3/ticker/price?symbol={symbol}"),
            "/price",
            quote_tier,
        )
    }

    pub fn coinbase(source_id: &str, product_id: &str, quote_tier: QuoteTier) -> Self {
        CryptoSpotFetcher::new(
            source_id,
            format!("https://api.exchange.coinbase.com/products/{product_id}/ticker"),
            "/price",
            quote_tier,
        )
        .with_volume_pointer("/volume")
    }

    pub fn kraken(source_id: &str, pair: &str, quote_tier: QuoteTier) -> Self {
        CryptoSpotFetcher::new(
            source_id,
            format!("https://api.kraken.com/0/public/Ticker?pair={pair}"),
            "/result",
            quote_tier,
        )
    }
}

fn pointer_decimal(body: &Value, pointer: &str, source_id: &str) -> Result<Decimal, FetchError> {
    let raw = body
        .pointer(pointer)
        .ok_or_else(|| FetchError::Parse {
            source_id: source_id.to_string(),
            detail: format!("missing field at {pointer}"),
        })?;
    let as_str = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(FetchError::Parse {
                source_id: source_id.to_string(),
                detail: format!("unexpected JSON type at {pointer}: {other}"),
            });
        }
    };
    Decimal::from_str(&as_str).map_err(|e| FetchError::Parse {
        source_id: source_id.to_string(),
        detail: format!("could not parse decimal {as_str:?}: {e}"),
    })
}

#[async_trait]
impl Fetcher for CryptoSpotFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, deadline: Duration) -> Result<Sample, FetchError> {
        let response = tokio::time::timeout(deadline, self.client.get(&self.url).send())
            .await
            .map_err(|_| FetchError::Transport {
                source_id: self.source_id.clone(),
                detail: "deadline exceeded".to_string(),
            })?
            .map_err(|e| FetchError::Transport {
                source_id: self.source_id.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                source_id: self.source_id.clone(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|e| FetchError::Parse {
            source_id: self.source_id.clone(),
            detail: e.to_string(),
        })?;

        let value = pointer_decimal(&body, self.price_pointer, &self.source_id)?;
        let mut sample = Sample::new(self.source_id.clone(), value, UtcTimestamp::try_now().map_err(
            |e| FetchError::Parse {
                source_id: self.source_id.clone(),
                detail: e.to_string(),
            },
        )?);
        if let Some(pointer) = self.volume_pointer {
            if let Ok(volume) = pointer_decimal(&body, pointer, &self.source_id) {
                sample = sample.with_volume(volume);
            }
        }
        Ok(sample)
    }
}
