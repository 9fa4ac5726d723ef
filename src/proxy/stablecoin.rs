//! Stablecoin-EVM rail (spec §3, §4.4 steps 4-6, §5 ordering): nonce
//! minting/redemption, offline signed-authorization verification, payer
//! enforcement, and the depeg circuit breaker.
//!
//! The external settlement facilitator is the authority on whether an
//! authorization actually moves funds on-chain (spec §1); this module only
//! performs the synchronous local gate described in step 5 — confirming the
//! presented authorization was validly signed by its claimed payer and
//! consuming the bound nonce — before releasing the attestation optimistically
//! and handing the authorization off for asynchronous settlement.

use alloy_primitives::{Address, Signature, keccak256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::timestamp::UtcTimestamp;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StablecoinError {
    #[error("X-Payment header was not valid base64/JSON: {0}")]
    MalformedEnvelope(String),
    #[error("authorization signature did not recover to the claimed payer address")]
    SignatureInvalid,
    #[error("nonce {0:?} is unknown")]
    UnknownNonce(String),
    #[error("nonce {0:?} was already used")]
    NonceUsed(String),
    #[error("nonce {0:?} has expired")]
    NonceExpired(String),
}

/// A server-minted, single-use, TTL-bound nonce (spec §3, §4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceState {
    Minted,
    Used,
}

struct NonceRecord {
    state: NonceState,
    expires_at: UtcTimestamp,
}

/// Keyed by the server-minted nonce string. `redeem`'s compare-and-set lives
/// inside a single `DashMap` shard lock, which is the "single row" the spec's
/// ordering section requires — concurrent redemption attempts against the
/// same nonce yield exactly one success.
pub struct NonceTable(DashMap<String, NonceRecord>);

impl Default for NonceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceTable {
    pub fn new() -> Self {
        NonceTable(DashMap::new())
    }

    /// Mints and persists a nonce as `minted` before ever returning it to a
    /// caller (spec §5 ordering).
    pub fn mint(&self, ttl: Duration, now: UtcTimestamp) -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);
        self.0.insert(
            nonce.clone(),
            NonceRecord {
                state: NonceState::Minted,
                expires_at: now.add_seconds(ttl.as_secs() as i64),
            },
        );
        nonce
    }

    /// Atomically transitions `minted -> used` (spec §8 "token replay
    /// protection": the same nonce presented twice yields 200 then 400
    /// regardless of interleaving).
    pub fn redeem(&self, nonce: &str, now: UtcTimestamp) -> Result<(), StablecoinError> {
        let mut record = self
            .0
            .get_mut(nonce)
            .ok_or_else(|| StablecoinError::UnknownNonce(nonce.to_string()))?;
        if record.expires_at.unix_seconds() < now.unix_seconds() {
            return Err(StablecoinError::NonceExpired(nonce.to_string()));
        }
        match record.state {
            NonceState::Used => Err(StablecoinError::NonceUsed(nonce.to_string())),
            NonceState::Minted => {
                record.state = NonceState::Used;
                Ok(())
            }
        }
    }
}

/// The standard x402 payment-requirements shape (spec §6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptsDescriptor {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub asset: String,
    pub pay_to: String,
    pub resource: String,
    pub mime_type: String,
    pub description: String,
    pub max_timeout_seconds: u64,
}

/// The EIP-3009-style signed transfer authorization carried inside the
/// `X-Payment` envelope, binding it to the server-minted nonce and a claimed
/// payer address (spec §3 "Payment Token (stablecoin-evm rail)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: i64,
    pub valid_before: i64,
    pub nonce: String,
    pub signature: String,
    /// Present only on a resubmission after an earlier optimistic delivery;
    /// absent on first presentation, since settlement is asynchronous.
    pub tx_hash: Option<String>,
}

pub fn parse_x_payment_header(value: &str) -> Result<SignedAuthorization, StablecoinError> {
    let raw = b64
        .decode(value)
        .map_err(|e| StablecoinError::MalformedEnvelope(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| StablecoinError::MalformedEnvelope(e.to_string()))
}

/// Confirms the authorization was signed by `auth.from`. The message hashed
/// binds every authorization field; the teacher's real facilitator (grounded
/// in `eip3009.rs`) additionally checks the EIP-712 domain separator and a
/// live on-chain balance — both of those are the external facilitator's job
/// at settlement, not this proxy's (spec §1).
pub fn verify_authorization_signature(auth: &SignedAuthorization) -> Result<(), StablecoinError> {
    let claimed_from = Address::from_str(&auth.from).map_err(|_| StablecoinError::SignatureInvalid)?;
    let sig_bytes =
        hex::decode(auth.signature.trim_start_matches("0x")).map_err(|_| StablecoinError::SignatureInvalid)?;
    let signature = Signature::from_raw(&sig_bytes).map_err(|_| StablecoinError::SignatureInvalid)?;

    let message = format!(
        "{}|{}|{}|{}|{}|{}",
        auth.from, auth.to, auth.value, auth.valid_after, auth.valid_before, auth.nonce
    );
    let hash = keccak256(message.as_bytes());

    let recovered = signature
        .recover_address_from_prehash(&hash)
        .map_err(|_| StablecoinError::SignatureInvalid)?;
    if recovered == claimed_from {
        Ok(())
    } else {
        Err(StablecoinError::SignatureInvalid)
    }
}

/// Time-window check mirroring EIP-3009's `validAfter <= now < validBefore`.
pub fn within_validity_window(auth: &SignedAuthorization, now: UtcTimestamp) -> bool {
    auth.valid_after <= now.unix_seconds() && now.unix_seconds() < auth.valid_before
}

/// Optimistic-delivery payment block attached to a stablecoin-rail response
/// (spec §4.4 step 8, §6).
#[derive(Debug, Clone, Serialize)]
pub struct PaymentDelivery {
    pub protocol: String,
    pub tx_hash: String,
    pub confirmed: bool,
}

/// `clean -> grace -> blocked`, forward-only in v1 (spec §3, §4.4 step 6).
#[derive(Debug, Clone, Default)]
struct PayerState {
    failures: Vec<UtcTimestamp>,
    grace_until: Option<UtcTimestamp>,
    blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenial {
    Grace { retry_after_secs: u64 },
    Blocked,
}

pub struct PayerTable {
    table: DashMap<String, PayerState>,
    grace_cooldown: Duration,
    blocked_threshold: u32,
    blocked_window: Duration,
}

impl PayerTable {
    pub fn new(grace_cooldown: Duration, blocked_threshold: u32, blocked_window: Duration) -> Self {
        PayerTable {
            table: DashMap::new(),
            grace_cooldown,
            blocked_threshold,
            blocked_window,
        }
    }

    /// Consulted before validating a token (spec §4.4 step 6): `blocked`
    /// denies without cooldown metadata; `grace_until > now` denies with it.
    pub fn check_admission(&self, payer: &str, now: UtcTimestamp) -> Result<(), AdmissionDenial> {
        let Some(state) = self.table.get(payer) else {
            return Ok(());
        };
        if state.blocked {
            return Err(AdmissionDenial::Blocked);
        }
        if let Some(grace_until) = state.grace_until {
            if grace_until.unix_seconds() > now.unix_seconds() {
                return Err(AdmissionDenial::Grace {
                    retry_after_secs: (grace_until.unix_seconds() - now.unix_seconds()) as u64,
                });
            }
        }
        Ok(())
    }

    /// Records an asynchronous settlement failure (spec §3 "Payer Enforcement
    /// State"): enters `grace` for `grace_cooldown`, or `blocked` once the
    /// trailing `blocked_window` holds `blocked_threshold` failures.
    pub fn record_failure(&self, payer: &str, now: UtcTimestamp) {
        let mut state = self.table.entry(payer.to_string()).or_default();
        if state.blocked {
            return;
        }
        state.failures.push(now);
        let window_start = now.unix_seconds() - self.blocked_window.as_secs() as i64;
        state.failures.retain(|t| t.unix_seconds() >= window_start);
        if state.failures.len() as u32 >= self.blocked_threshold {
            state.blocked = true;
            state.grace_until = None;
        } else {
            state.grace_until = Some(now.add_seconds(self.grace_cooldown.as_secs() as i64));
        }
    }

    #[cfg(test)]
    fn is_blocked(&self, payer: &str) -> bool {
        self.table.get(payer).map(|s| s.blocked).unwrap_or(false)
    }
}

/// Posts a delivered authorization to the external settlement facilitator
/// and, if it does not confirm, records the failure against the claimed
/// payer (spec §4.4 step 5: "submit the authorization for settlement
/// asynchronously; on settlement failure, record the payer's identity").
/// Runs detached from the request that triggered it — the attestation has
/// already shipped optimistically.
pub async fn submit_settlement(
    client: &reqwest::Client,
    facilitator_url: &url::Url,
    payer_table: &PayerTable,
    auth: &SignedAuthorization,
) {
    let Ok(now) = UtcTimestamp::try_now() else { return };
    let outcome = client.post(facilitator_url.clone()).json(auth).send().await;
    let settled = matches!(outcome, Ok(resp) if resp.status().is_success());
    if !settled {
        payer_table.record_failure(&auth.from, now);
    }
}

/// Process-wide stablecoin-peg state, recomputed on a background cadence and
/// consulted as an admission gate, never recomputed per request (spec §4.4
/// step 6, §5 "Cancellation and timeouts").
#[derive(Debug, Clone, Copy)]
pub struct DepegSnapshot {
    pub peg_ok: bool,
    pub last_checked: UtcTimestamp,
    pub last_median: Decimal,
}

pub struct DepegTracker {
    inner: tokio::sync::RwLock<DepegSnapshot>,
    tolerance: Decimal,
}

impl DepegTracker {
    pub fn new(tolerance: Decimal, now: UtcTimestamp) -> Self {
        DepegTracker {
            inner: tokio::sync::RwLock::new(DepegSnapshot {
                peg_ok: true,
                last_checked: now,
                last_median: Decimal::ONE,
            }),
            tolerance,
        }
    }

    pub async fn recheck(&self, stablecoin_usd_median: Decimal, now: UtcTimestamp) {
        let deviation = (stablecoin_usd_median - Decimal::ONE).abs();
        let peg_ok = deviation <= self.tolerance;
        let mut guard = self.inner.write().await;
        *guard = DepegSnapshot {
            peg_ok,
            last_checked: now,
            last_median: stablecoin_usd_median,
        };
    }

    pub async fn is_ok(&self) -> bool {
        self.inner.read().await.peg_ok
    }

    pub async fn snapshot(&self) -> DepegSnapshot {
        *self.inner.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Signs a freshly built authorization with a random key and returns the
    /// address it should recover to, mirroring the client side of the rail
    /// this module only ever verifies.
    fn signed_pair() -> (Address, SignedAuthorization) {
        use k256::ecdsa::SigningKey;
        use rand::RngCore;

        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes((&seed).into()).unwrap();
        let address = Address::from_public_key(signing_key.verifying_key());

        let mut auth = SignedAuthorization {
            from: address.to_string(),
            to: "0x000000000000000000000000000000000000aa".to_string(),
            value: "1000000".to_string(),
            valid_after: 0,
            valid_before: 9_999_999_999,
            nonce: "abc123".to_string(),
            signature: String::new(),
            tx_hash: None,
        };
        let message = format!(
            "{}|{}|{}|{}|{}|{}",
            auth.from, auth.to, auth.value, auth.valid_after, auth.valid_before, auth.nonce
        );
        let hash = keccak256(message.as_bytes());
        let (sig, recid) = signing_key.sign_prehash_recoverable(hash.as_slice()).unwrap();
        let signature = Signature::new(sig.r().into(), sig.s().into(), recid.is_y_odd());
        auth.signature = hex::encode(signature.as_bytes());
        (address, auth)
    }

    #[test]
    fn valid_signature_recovers_claimed_from() {
        let (_address, auth) = signed_pair();
        assert!(verify_authorization_signature(&auth).is_ok());
    }

    #[test]
    fn tampered_value_fails_signature_check() {
        let (_address, mut auth) = signed_pair();
        auth.value = "2000000".to_string();
        assert_eq!(
            verify_authorization_signature(&auth),
            Err(StablecoinError::SignatureInvalid)
        );
    }

    #[test]
    fn nonce_redeemed_twice_is_rejected_the_second_time() {
        let table = NonceTable::new();
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        let nonce = table.mint(Duration::from_secs(600), now);
        assert!(table.redeem(&nonce, now).is_ok());
        assert_eq!(table.redeem(&nonce, now), Err(StablecoinError::NonceUsed(nonce)));
    }

    #[test]
    fn expired_nonce_is_rejected() {
        let table = NonceTable::new();
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        let nonce = table.mint(Duration::from_secs(60), now);
        let later = now.add_seconds(120);
        assert_eq!(
            table.redeem(&nonce, later),
            Err(StablecoinError::NonceExpired(nonce))
        );
    }

    #[test]
    fn payer_blocks_after_threshold_failures_in_window() {
        let table = PayerTable::new(Duration::from_secs(600), 3, Duration::from_secs(7 * 24 * 3600));
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        table.record_failure("payer-1", now);
        assert!(matches!(
            table.check_admission("payer-1", now),
            Err(AdmissionDenial::Grace { .. })
        ));
        table.record_failure("payer-1", now.add_seconds(1));
        table.record_failure("payer-1", now.add_seconds(2));
        assert!(table.is_blocked("payer-1"));
        assert_eq!(table.check_admission("payer-1", now.add_seconds(9999)), Err(AdmissionDenial::Blocked));
    }

    #[tokio::test]
    async fn depeg_tracker_trips_outside_tolerance() {
        let now = UtcTimestamp::from_unix_seconds(1_800_000_000);
        let tracker = DepegTracker::new(Decimal::from_str("0.02").unwrap(), now);
        assert!(tracker.is_ok().await);
        tracker
            .recheck(Decimal::from_str("0.95").unwrap(), now.add_seconds(60))
            .await;
        assert!(!tracker.is_ok().await);
    }
}
