//! Trade-stream fetchers (spec §4.1, used by VWAP domains, spec §4.2 step 5):
//! GET a trade-history endpoint over a fixed lookback window and return
//! `[{price, volume}]`. The Aggregation Engine pools these across sources.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use super::{FetchError, TradeStreamFetcher};

pub struct HttpTradeStreamFetcher {
    source_id: String,
    url: String,
    client: reqwest::Client,
    /// JSON pointer to the array of trades within the response body.
    trades_pointer: &'static str,
    price_field: &'static str,
    volume_field: &'static str,
}

impl HttpTradeStreamFetcher {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        trades_pointer: &'static str,
        price_field: &'static str,
        volume_field: &'static str,
    ) -> Self {
        HttpTradeStreamFetcher {
            source_id: source_id.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            trades_pointer,
            price_field,
            volume_field,
        }
    }
}

fn field_decimal(trade: &Value, field: &str, source_id: &str) -> Result<Decimal, FetchError> {
    let raw = trade.get(field).ok_or_else(|| FetchError::Parse {
        source_id: source_id.to_string(),
        detail: format!("trade missing field {field}"),
    })?;
    let as_str = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(FetchError::Parse {
                source_id: source_id.to_string(),
                detail: format!("unexpected JSON type for {field}: {other}"),
            });
        }
    };
    Decimal::from_str(&as_str).map_err(|e| FetchError::Parse {
        source_id: source_id.to_string(),
        detail: format!("could not parse decimal {as_str:?}: {e}"),
    })
}

#[async_trait]
impl TradeStreamFetcher for HttpTradeStreamFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_trades(
        &self,
        deadline: Duration,
    ) -> Result<Vec<(Decimal, Decimal)>, FetchError> {
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

        let trades = body
            .pointer(self.trades_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Parse {
                source_id: self.source_id.clone(),
                detail: format!("missing trade array at {}", self.trades_pointer),
            })?;

        trades
            .iter()
            .map(|trade| {
                let price = field_decimal(trade, self.price_field, &self.source_id)?;
                let volume = field_decimal(trade, self.volume_field, &self.source_id)?;
                Ok((price, volume))
            })
            .collect()
    }
}
