//! Digit-decomposed Schnorr attestations bound to pre-committed nonce
//! commitments (spec §4.3 derivatives variant; §9 "Schnorr nonce lifecycle").
//!
//! For each digit position `i` of the attested price, a nonce scalar `k_i`
//! is generated at announcement time and published as `R_i = k_i·G`; at
//! attestation, `s_i = k_i + e_i·x` is released and `k_i` is destroyed. This
//! module implements only the pure arithmetic; the single-use discipline
//! (generate once at announcement, consume exactly once at attestation) is
//! enforced by the scheduler's nonce store (`scheduler.rs`), whose `remove`
//! on a `DashMap` is the atomic "take exactly once" operation — a second
//! attestation attempt against the same `(event_id, digit_index)` finds no
//! stored scalar and is refused outright, rather than signing a second
//! message under the same `k_i`.

use rand::RngCore;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum SchnorrError {
    #[error("digest did not reduce to a valid curve scalar")]
    InvalidScalar,
    #[error("secp256k1 operation failed: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// A freshly generated, per-digit-per-event nonce. `scalar` must be held in
/// secure storage and read exactly once, at attestation; `point` is published
/// immediately at announcement.
pub struct DigitNonce {
    pub scalar: SecretKey,
    pub point: PublicKey,
}

pub fn generate_nonce(secp: &Secp256k1<All>) -> DigitNonce {
    let mut bytes = [0u8; 32];
    loop {
        rand::rng().fill_bytes(&mut bytes);
        if let Ok(scalar) = SecretKey::from_slice(&bytes) {
            let point = PublicKey::from_secret_key(secp, &scalar);
            return DigitNonce { scalar, point };
        }
    }
}

/// `e_i = SHA256(event_id || i || digit)`, reduced to a curve scalar.
pub fn challenge_scalar(event_id: &str, digit_index: u32, digit: u8) -> Result<Scalar, SchnorrError> {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    hasher.update(digit_index.to_be_bytes());
    hasher.update([digit]);
    let digest: [u8; 32] = hasher.finalize().into();
    Scalar::from_be_bytes(digest).map_err(|_| SchnorrError::InvalidScalar)
}

/// `s_i = k_i + e_i·x`. Takes `nonce_scalar` by value so the caller cannot
/// retain and reuse it; the caller still owns deleting the corresponding
/// entry from the nonce store.
pub fn sign_digit(
    nonce_scalar: SecretKey,
    challenge: &Scalar,
    oracle_secret: &SecretKey,
) -> Result<SecretKey, SchnorrError> {
    let e_times_x = oracle_secret.mul_tweak(challenge)?;
    let e_times_x_scalar =
        Scalar::from_be_bytes(e_times_x.secret_bytes()).map_err(|_| SchnorrError::InvalidScalar)?;
    let s = nonce_scalar.add_tweak(&e_times_x_scalar)?;
    Ok(s)
}

/// Verifies `s_i·G == R_i + e_i·P`.
pub fn verify_digit(
    secp: &Secp256k1<All>,
    nonce_point: &PublicKey,
    challenge: &Scalar,
    oracle_pubkey: &PublicKey,
    s: &SecretKey,
) -> bool {
    let lhs = PublicKey::from_secret_key(secp, s);
    let e_p = match oracle_pubkey.mul_tweak(secp, challenge) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let rhs = match nonce_point.combine(&e_p) {
        Ok(p) => p,
        Err(_) => return false,
    };
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_key() -> (Secp256k1<All>, SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        let secret = SecretKey::from_slice(&bytes).unwrap();
        let public = PublicKey::from_secret_key(&secp, &secret);
        (secp, secret, public)
    }

    #[test]
    fn digit_attestation_verifies_under_published_nonce_and_pubkey() {
        let (secp, x, p) = oracle_key();
        let nonce = generate_nonce(&secp);
        let e = challenge_scalar("evt-1", 0, 7).unwrap();
        let s = sign_digit(nonce.scalar, &e, &x).unwrap();
        assert!(verify_digit(&secp, &nonce.point, &e, &p, &s));
    }

    #[test]
    fn verification_fails_against_a_different_digit_challenge() {
        let (secp, x, p) = oracle_key();
        let nonce = generate_nonce(&secp);
        let e_signed = challenge_scalar("evt-1", 0, 7).unwrap();
        let s = sign_digit(nonce.scalar, &e_signed, &x).unwrap();
        let e_wrong = challenge_scalar("evt-1", 0, 8).unwrap();
        assert!(!verify_digit(&secp, &nonce.point, &e_wrong, &p, &s));
    }

    #[test]
    fn verification_fails_under_the_wrong_oracle_pubkey() {
        let (secp, x, _p) = oracle_key();
        let (_secp2, _x2, p2) = oracle_key();
        let nonce = generate_nonce(&secp);
        let e = challenge_scalar("evt-1", 1, 3).unwrap();
        let s = sign_digit(nonce.scalar, &e, &x).unwrap();
        assert!(!verify_digit(&secp, &nonce.point, &e, &p2, &s));
    }

    #[test]
    fn distinct_digit_indices_produce_distinct_challenges() {
        let e0 = challenge_scalar("evt-1", 0, 5).unwrap();
        let e1 = challenge_scalar("evt-1", 1, 5).unwrap();
        assert_ne!(e0.to_be_bytes(), e1.to_be_bytes());
    }
}
