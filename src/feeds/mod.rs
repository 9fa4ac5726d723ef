//! Feed Fetchers (spec §4.1): per-source adapters returning a [`Sample`] or a
//! typed [`FetchError`]. Fetchers never retry internally — the Aggregation
//! Engine makes retry/fallback policy visible by only ever calling `fetch`
//! once per request and letting quorum absorb individual failures.
//!
//! Per Design Note §9 ("per-feed reflection/duck typing → uniform fetcher
//! contract"), every source implements the same [`Fetcher`] trait regardless
//! of asset class.

pub mod crypto_spot;
pub mod official_rate;
pub mod trade_stream;

use async_trait::async_trait;
use std::time::Duration;

use crate::model::Sample;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("{source_id}: transport error: {detail}")]
    Transport { source_id: String, detail: String },
    #[error("{source_id}: unexpected HTTP status {status}")]
    HttpStatus { source_id: String, status: u16 },
    #[error("{source_id}: could not parse response body: {detail}")]
    Parse { source_id: String, detail: String },
    #[error("{source_id}: source-supplied timestamp is stale")]
    Stale { source_id: String },
}

impl FetchError {
    pub fn source_id(&self) -> &str {
        match self {
            FetchError::Transport { source_id, .. }
            | FetchError::HttpStatus { source_id, .. }
            | FetchError::Parse { source_id, .. }
            | FetchError::Stale { source_id } => source_id,
        }
    }
}

/// `fetch(deadline) -> Sample | FetchError`. Implementors must not retry;
/// one failed attempt is one failed sample from the aggregator's point of view.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, deadline: Duration) -> Result<Sample, FetchError>;
}

/// A pooled trade-history fetcher for VWAP domains (spec §4.1, §4.2 step 5):
/// returns the raw `[{price, volume}]` sequence rather than a single reduced
/// [`Sample`].
#[async_trait]
pub trait TradeStreamFetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_trades(
        &self,
        deadline: Duration,
    ) -> Result<Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>, FetchError>;
}
