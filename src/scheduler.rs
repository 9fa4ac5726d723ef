//! Scheduler (spec §4.5 derivatives variant): one cooperative task that every
//! period (default one hour) Announces upcoming events, Attests matured ones,
//! and on start Recovers state from whatever was persisted.

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use secp256k1::{All, Secp256k1, SecretKey};
use std::time::Duration;

use crate::aggregation::{AggregationEngine, AggregationError};
use crate::model::Event;
use crate::schnorr::{self, SchnorrError};
use crate::timestamp::UtcTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown event id {0:?}")]
    UnknownEvent(String),
    #[error("attestation engine failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("signing failed: {0}")]
    Signer(#[from] SchnorrError),
    #[error("price {price} out of range for {digit_count} base-10 digits")]
    PriceOutOfRange { price: i64, digit_count: u32 },
    #[error("nonce for (event {event_id:?}, digit {digit_index}) was already consumed or never announced")]
    NonceAlreadyConsumed { event_id: String, digit_index: u32 },
}

/// Keyed by `(event_id, digit_index)`. Holding a live nonce scalar in a
/// concurrent map is the "secure storage ... read exactly once" the spec
/// calls for: `DashMap::remove` is the atomic single-consumption primitive —
/// a second attestation attempt finds nothing and is refused.
type NonceStore = DashMap<(String, u32), SecretKey>;

pub struct Scheduler {
    secp: Secp256k1<All>,
    events: DashMap<String, Event>,
    nonces: NonceStore,
    announcement_horizon: Duration,
    attestation_period: Duration,
    digit_count: u32,
    missed_grace: Duration,
}

impl Scheduler {
    pub fn new(
        announcement_horizon: Duration,
        attestation_period: Duration,
        digit_count: u32,
        missed_grace: Duration,
    ) -> Self {
        Scheduler {
            secp: Secp256k1::new(),
            events: DashMap::new(),
            nonces: NonceStore::new(),
            announcement_horizon,
            attestation_period,
            digit_count,
            missed_grace,
        }
    }

    fn event_id(pair: &str, maturity: &UtcTimestamp) -> String {
        format!("{pair}-{}", maturity.unix_seconds())
    }

    /// Ensures every period-boundary inside `announcement_horizon` has a
    /// published event for `pair` with a fully populated `r_points` sequence.
    pub fn announce(&self, pair: &str, now: UtcTimestamp) {
        let period_secs = self.attestation_period.as_secs() as i64;
        let horizon_secs = self.announcement_horizon.as_secs() as i64;
        if period_secs <= 0 {
            return;
        }
        let mut offset = period_secs;
        while offset <= horizon_secs {
            let maturity = now.add_seconds(offset);
            let event_id = Self::event_id(pair, &maturity);
            if !self.events.contains_key(&event_id) {
                self.publish_new_event(event_id, pair, maturity);
            }
            offset += period_secs;
        }
    }

    fn publish_new_event(&self, event_id: String, pair: &str, maturity: UtcTimestamp) {
        let mut r_points = Vec::with_capacity(self.digit_count as usize);
        for digit_index in 0..self.digit_count {
            let nonce = schnorr::generate_nonce(&self.secp);
            r_points.push(hex::encode(nonce.point.serialize()));
            self.nonces.insert((event_id.clone(), digit_index), nonce.scalar);
        }
        self.events.insert(
            event_id.clone(),
            Event {
                event_id,
                pair: pair.to_string(),
                maturity,
                digit_count: self.digit_count,
                r_points,
                s_values: None,
                price: None,
                attested_at: None,
                missed: false,
            },
        );
    }

    /// Attests a matured event: runs `engine` to get the current price,
    /// decomposes it into base-10 digits, signs each digit against its
    /// pre-committed nonce, and atomically consumes those nonces.
    pub async fn attest(
        &self,
        event_id: &str,
        engine: &AggregationEngine,
        oracle_secret: &SecretKey,
        now: UtcTimestamp,
    ) -> Result<(), SchedulerError> {
        let digit_count = self
            .events
            .get(event_id)
            .map(|e| e.digit_count)
            .ok_or_else(|| SchedulerError::UnknownEvent(event_id.to_string()))?;

        let assertion = engine.aggregate().await?;
        let price = assertion
            .value
            .trunc()
            .to_i64()
            .ok_or(SchedulerError::PriceOutOfRange { price: 0, digit_count })?;

        let min_price = 10i64.pow(digit_count - 1);
        let max_price = 10i64.pow(digit_count) - 1;
        if price < min_price || price > max_price {
            return Err(SchedulerError::PriceOutOfRange { price, digit_count });
        }

        let digits = decompose_digits(price, digit_count);
        let mut s_values = Vec::with_capacity(digit_count as usize);
        for (i, digit) in digits.iter().enumerate() {
            let digit_index = i as u32;
            let (_, nonce_scalar) = self
                .nonces
                .remove(&(event_id.to_string(), digit_index))
                .ok_or_else(|| SchedulerError::NonceAlreadyConsumed {
                    event_id: event_id.to_string(),
                    digit_index,
                })?;
            let challenge = schnorr::challenge_scalar(event_id, digit_index, *digit)?;
            let s = schnorr::sign_digit(nonce_scalar, &challenge, oracle_secret)?;
            s_values.push(hex::encode(s.secret_bytes()));
        }

        let mut event = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| SchedulerError::UnknownEvent(event_id.to_string()))?;
        event.price = Some(price);
        event.s_values = Some(s_values);
        event.attested_at = Some(now);
        event.missed = false;
        Ok(())
    }

    /// On start (and on every periodic tick): a past-maturity event without
    /// `s_values` is retried while still inside `missed_grace` of its
    /// maturity; only once that window has elapsed is it marked `missed`
    /// (spec §4.5 — "either retry attestation, if within a short grace
    /// window, or mark it missed"). A later successful [`Self::attest`]
    /// clears `missed` again.
    pub fn recover(&self, pair: &str, now: UtcTimestamp) {
        let grace_secs = self.missed_grace.as_secs() as i64;
        for mut event in self.events.iter_mut() {
            if event.pair != pair {
                continue;
            }
            if event.s_values.is_none() && now.unix_seconds() > event.maturity.unix_seconds() + grace_secs {
                event.missed = true;
            }
        }
        self.announce(pair, now);
    }

    /// Past-maturity events without `s_values` that are not yet `missed` —
    /// candidates for the periodic loop's attestation attempt. Excludes
    /// events `recover` has already marked `missed` (terminal, not retried
    /// indefinitely).
    pub fn attestable(&self, pair: &str, now: UtcTimestamp) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| {
                e.pair == pair && e.s_values.is_none() && !e.missed && e.maturity.unix_seconds() <= now.unix_seconds()
            })
            .map(|e| e.event_id.clone())
            .collect()
    }

    pub fn event(&self, event_id: &str) -> Option<Event> {
        self.events.get(event_id).map(|e| e.clone())
    }

    pub fn upcoming_events(&self, pair: &str) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.pair == pair)
            .map(|e| e.value().clone())
            .collect()
    }
}

fn decompose_digits(price: i64, digit_count: u32) -> Vec<u8> {
    let mut digits = vec![0u8; digit_count as usize];
    let mut remaining = price;
    for slot in digits.iter_mut().rev() {
        *slot = (remaining % 10) as u8;
        remaining /= 10;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{FetchError, Fetcher};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Arc;

    struct FixedFetcher(Decimal);

    #[async_trait]
    impl Fetcher for FixedFetcher {
        fn source_id(&self) -> &str {
            "fixed"
        }
        async fn fetch(&self, _deadline: Duration) -> Result<crate::model::Sample, FetchError> {
            Ok(crate::model::Sample::new(
                "fixed",
                self.0,
                UtcTimestamp::from_unix_seconds(0),
            ))
        }
    }

    fn oracle_secret() -> SecretKey {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        SecretKey::from_slice(&bytes).unwrap()
    }

    fn test_grace() -> Duration {
        Duration::from_secs(600)
    }

    #[test]
    fn announce_populates_every_period_boundary_in_the_horizon() {
        let scheduler = Scheduler::new(Duration::from_secs(4 * 3600), Duration::from_secs(3600), 5, test_grace());
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        scheduler.announce("BTCUSD", now);
        let events = scheduler.upcoming_events("BTCUSD");
        assert_eq!(events.len(), 4);
        for event in &events {
            assert_eq!(event.r_points.len(), 5);
            assert!(event.s_values.is_none());
        }
    }

    #[tokio::test]
    async fn attest_populates_digits_and_consumes_nonces_exactly_once() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(3600), 5, test_grace());
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        scheduler.announce("BTCUSD", now);
        let event_id = scheduler.upcoming_events("BTCUSD")[0].event_id.clone();

        let engine = AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            0,
            vec![Arc::new(FixedFetcher(Decimal::from_str("69420").unwrap()))],
            1,
            Duration::from_secs(3),
        );
        let secret = oracle_secret();
        scheduler.attest(&event_id, &engine, &secret, now).await.unwrap();

        let event = scheduler.event(&event_id).unwrap();
        assert_eq!(event.price, Some(69420));
        assert_eq!(event.s_values.as_ref().unwrap().len(), 5);

        let second_attempt = scheduler.attest(&event_id, &engine, &secret, now).await;
        assert!(matches!(
            second_attempt,
            Err(SchedulerError::NonceAlreadyConsumed { .. })
        ));
    }

    #[test]
    fn recover_marks_past_maturity_unattested_events_as_missed() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(3600), 5, test_grace());
        let earlier = UtcTimestamp::from_unix_seconds(1_700_000_000);
        scheduler.announce("BTCUSD", earlier);
        let later = UtcTimestamp::from_unix_seconds(1_800_000_000);
        scheduler.recover("BTCUSD", later);
        let events = scheduler.upcoming_events("BTCUSD");
        assert!(events.iter().any(|e| e.missed));
    }

    #[test]
    fn recover_does_not_mark_missed_while_still_inside_the_grace_window() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(3600), 5, test_grace());
        let earlier = UtcTimestamp::from_unix_seconds(1_700_000_000);
        scheduler.announce("BTCUSD", earlier);
        let event_id = scheduler.upcoming_events("BTCUSD")[0].event_id.clone();
        let maturity = scheduler.event(&event_id).unwrap().maturity.unix_seconds();

        // Just past maturity but still inside the grace window: not missed yet.
        let just_past = UtcTimestamp::from_unix_seconds(maturity + 60);
        scheduler.recover("BTCUSD", just_past);
        let event = scheduler.event(&event_id).unwrap();
        assert!(!event.missed);
        assert!(scheduler.attestable("BTCUSD", just_past).contains(&event_id));

        // Past the grace window: now terminal.
        let well_past = UtcTimestamp::from_unix_seconds(maturity + test_grace().as_secs() as i64 + 1);
        scheduler.recover("BTCUSD", well_past);
        let event = scheduler.event(&event_id).unwrap();
        assert!(event.missed);
        assert!(!scheduler.attestable("BTCUSD", well_past).contains(&event_id));
    }

    #[tokio::test]
    async fn a_successful_attest_clears_a_prior_missed_flag() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(3600), 5, test_grace());
        let earlier = UtcTimestamp::from_unix_seconds(1_700_000_000);
        scheduler.announce("BTCUSD", earlier);
        let event_id = scheduler.upcoming_events("BTCUSD")[0].event_id.clone();

        let later = UtcTimestamp::from_unix_seconds(1_800_000_000);
        scheduler.recover("BTCUSD", later);
        assert!(scheduler.event(&event_id).unwrap().missed);

        let engine = AggregationEngine::direct_median(
            "BTCUSD",
            "USD",
            0,
            vec![Arc::new(FixedFetcher(Decimal::from_str("69420").unwrap()))],
            1,
            Duration::from_secs(3),
        );
        let secret = oracle_secret();
        scheduler.attest(&event_id, &engine, &secret, later).await.unwrap();
        assert!(!scheduler.event(&event_id).unwrap().missed);
    }
}
