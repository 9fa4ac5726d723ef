//! Official-rate fetchers (spec §4.1): central-bank style JSON releases.
//! Direct pairs read a single published rate; indirect pairs compute a cross
//! from two published rates (e.g. `EURUSD = EURCAD / USDCAD`). The
//! publication timestamp is always propagated so the aggregator can reject
//! stale releases outside the configured window (spec §9 open question:
//! a sample older than `fetch_deadline` is treated as a fetch failure).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use super::{FetchError, Fetcher};
use crate::model::Sample;
use crate::timestamp::UtcTimestamp;

/// How the rate is derived from the release body.
pub enum RateShape {
    /// A single rate at `pointer`, with a publication timestamp at `ts_pointer`.
    Direct {
        pointer: &'static str,
        ts_pointer: &'static str,
    },
    /// `result = numerator_pointer / denominator_pointer` (e.g.
    /// `EURUSD = EURCAD / USDCAD`), both read from the same release body.
    Indirect {
        numerator_pointer: &'static str,
        denominator_pointer: &'static str,
        ts_pointer: &'static str,
    },
}

pub struct OfficialRateFetcher {
    source_id: String,
    url: String,
    client: reqwest::Client,
    shape: RateShape,
    /// Releases older than this are treated as a fetch failure rather than
    /// participating in aggregation.
    max_age: Duration,
}

impl OfficialRateFetcher {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        shape: RateShape,
        max_age: Duration,
    ) -> Self {
        OfficialRateFetcher {
            source_id: source_id.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            shape,
            max_age,
        }
    }
}

fn pointer_decimal(body: &Value, pointer: &str, source_id: &str) -> Result<Decimal, FetchError> {
    let raw = body.pointer(pointer).ok_or_else(|| FetchError::Parse {
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

fn pointer_timestamp(body: &Value, pointer: &str, source_id: &str) -> Result<UtcTimestamp, FetchError> {
    let raw = body
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::Parse {
            source_id: source_id.to_string(),
            detail: format!("missing/non-string timestamp at {pointer}"),
        })?;
    UtcTimestamp::parse(raw).map_err(|e| FetchError::Parse {
        source_id: source_id.to_string(),
        detail: format!("could not parse timestamp {raw:?}: {e}"),
    })
}

#[async_trait]
impl Fetcher for OfficialRateFetcher {
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

        let (value, published_at) = match &self.shape {
            RateShape::Direct { pointer, ts_pointer } => {
                let value = pointer_decimal(&body, pointer, &self.source_id)?;
                let published_at = pointer_timestamp(&body, ts_pointer, &self.source_id)?;
                (value, published_at)
            }
            RateShape::Indirect {
                numerator_pointer,
                denominator_pointer,
                ts_pointer,
            } => {
                let numerator = pointer_decimal(&body, numerator_pointer, &self.source_id)?;
                let denominator = pointer_decimal(&body, denominator_pointer, &self.source_id)?;
                if denominator.is_zero() {
                    return Err(FetchError::Parse {
                        source_id: self.source_id.clone(),
                        detail: "denominator rate is zero".to_string(),
                    });
                }
                let published_at = pointer_timestamp(&body, ts_pointer, &self.source_id)?;
                (numerator / denominator, published_at)
            }
        };

        let now = UtcTimestamp::try_now().map_err(|e| FetchError::Parse {
            source_id: self.source_id.clone(),
            detail: e.to_string(),
        })?;
        let age_secs = (now.unix_seconds() - published_at.unix_seconds()).max(0) as u64;
        if age_secs > self.max_age.as_secs() {
            return Err(FetchError::Stale {
                source_id: self.source_id.clone(),
            });
        }

        Ok(Sample::new(self.source_id.clone(), value, published_at))
    }
}
