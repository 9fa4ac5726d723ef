//! Shared scaffolding for the full-router integration tests: a fixed-value
//! [`Fetcher`] standing in for a real price source, and an ephemeral
//! [`Keystore`] so tests never touch a shared directory.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use rate_oracle::feeds::{FetchError, Fetcher};
use rate_oracle::keystore::Keystore;
use rate_oracle::model::Sample;
use rate_oracle::timestamp::UtcTimestamp;

pub struct FixedFetcher {
    id: String,
    value: Decimal,
}

impl FixedFetcher {
    pub fn new(id: impl Into<String>, value: Decimal) -> Arc<dyn Fetcher> {
        Arc::new(FixedFetcher { id: id.into(), value })
    }
}

#[async_trait]
impl Fetcher for FixedFetcher {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _deadline: Duration) -> Result<Sample, FetchError> {
        Ok(Sample::new(
            self.id.clone(),
            self.value,
            UtcTimestamp::try_now().expect("system clock"),
        ))
    }
}

pub fn ephemeral_keystore() -> (Keystore, TempDir) {
    let dir = TempDir::new().expect("scratch dir");
    let keystore = Keystore::load_or_generate(dir.path()).expect("keystore generation");
    (keystore, dir)
}
