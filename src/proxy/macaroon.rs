//! Macaroon minting and verification for the lightning-channel rail (spec §3, §4.4).
//!
//! A macaroon identifier binds a scheme version, the invoice's 32-byte payment
//! hash, and 32 fresh random bytes, MACed under the process-wide root secret.
//! Verifying a macaroon never requires a call back to the Lightning node: the
//! presented preimage is itself proof of payment, since only the node that
//! settled the invoice could have revealed it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

const SCHEME_VERSION: u8 = 1;
const MAC_LEN: usize = 32;
/// `version(1) || payment_hash(32) || token_id(32)`
const IDENTIFIER_LEN: usize = 1 + 32 + 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacaroonError {
    #[error("macaroon is not valid base64/hex")]
    Malformed,
    #[error("macaroon identifier has unexpected length")]
    WrongLength,
    #[error("unsupported macaroon scheme version {0}")]
    UnsupportedVersion(u8),
    #[error("macaroon MAC did not verify under the root key")]
    BadMac,
    #[error("preimage does not hash to the macaroon's payment hash")]
    PreimageMismatch,
}

/// A minted macaroon: the identifier plus its MAC, concatenated and encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    pub payment_hash: [u8; 32],
    pub token_id: [u8; 32],
    mac: [u8; MAC_LEN],
}

impl Macaroon {
    /// Mints a fresh macaroon bound to `payment_hash`, strictly after the
    /// invoice that produced that hash was created (spec §5 ordering).
    pub fn mint(root_secret: &[u8; 32], payment_hash: [u8; 32]) -> Self {
        let mut token_id = [0u8; 32];
        rand::rng().fill_bytes(&mut token_id);
        let mac = compute_mac(root_secret, &payment_hash, &token_id);
        Macaroon {
            payment_hash,
            token_id,
            mac,
        }
    }

    fn identifier_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IDENTIFIER_LEN);
        buf.push(SCHEME_VERSION);
        buf.extend_from_slice(&self.payment_hash);
        buf.extend_from_slice(&self.token_id);
        buf
    }

    /// Serializes as `base64(identifier || mac)`, the form carried in the
    /// `WWW-Authenticate: L402` challenge and round-tripped in the client's
    /// `Authorization: L402 <macaroon>:<preimage>` retry.
    pub fn encode(&self) -> String {
        let mut buf = self.identifier_bytes();
        buf.extend_from_slice(&self.mac);
        b64.encode(buf)
    }

    pub fn decode(encoded: &str) -> Result<Self, MacaroonError> {
        let raw = b64.decode(encoded).map_err(|_| MacaroonError::Malformed)?;
        if raw.len() != IDENTIFIER_LEN + MAC_LEN {
            return Err(MacaroonError::WrongLength);
        }
        let version = raw[0];
        if version != SCHEME_VERSION {
            return Err(MacaroonError::UnsupportedVersion(version));
        }
        let mut payment_hash = [0u8; 32];
        payment_hash.copy_from_slice(&raw[1..33]);
        let mut token_id = [0u8; 32];
        token_id.copy_from_slice(&raw[33..65]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&raw[65..97]);
        Ok(Macaroon {
            payment_hash,
            token_id,
            mac,
        })
    }

    /// Verifies the MAC under `root_secret`, then that `preimage` hashes to
    /// this macaroon's embedded payment hash (spec §4.4 step 5, §8 "Macaroon
    /// binding"). Constant-time comparisons throughout.
    pub fn verify(&self, root_secret: &[u8; 32], preimage: &[u8; 32]) -> Result<(), MacaroonError> {
        let expected_mac = compute_mac(root_secret, &self.payment_hash, &self.token_id);
        if !constant_time_eq(&expected_mac, &self.mac) {
            return Err(MacaroonError::BadMac);
        }
        let computed_hash: [u8; 32] = sha2::Sha256::digest(preimage).into();
        if !constant_time_eq(&computed_hash, &self.payment_hash) {
            return Err(MacaroonError::PreimageMismatch);
        }
        Ok(())
    }
}

use sha2::Digest;

fn compute_mac(root_secret: &[u8; 32], payment_hash: &[u8; 32], token_id: &[u8; 32]) -> [u8; MAC_LEN] {
    let mut mac = Hmac::<Sha256>::new_from_slice(root_secret).expect("HMAC accepts any key length");
    mac.update(&[SCHEME_VERSION]);
    mac.update(payment_hash);
    mac.update(token_id);
    mac.finalize().into_bytes().into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; MAC_LEN]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Parses the `Authorization: L402 <macaroon>:<preimage_hex>` header value
/// presented on a paid retry.
pub fn parse_authorization_header(value: &str) -> Option<(Macaroon, [u8; 32])> {
    let rest = value.strip_prefix("L402 ")?;
    let (macaroon_part, preimage_part) = rest.split_once(':')?;
    let macaroon = Macaroon::decode(macaroon_part).ok()?;
    let preimage_bytes = hex::decode(preimage_part).ok()?;
    let preimage: [u8; 32] = preimage_bytes.try_into().ok()?;
    Some((macaroon, preimage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preimage_and_hash() -> ([u8; 32], [u8; 32]) {
        let preimage = [9u8; 32];
        let hash: [u8; 32] = sha2::Sha256::digest(preimage).into();
        (preimage, hash)
    }

    #[test]
    fn mints_and_verifies_round_trip() {
        let root = [1u8; 32];
        let (preimage, hash) = preimage_and_hash();
        let m = Macaroon::mint(&root, hash);
        let encoded = m.encode();
        let decoded = Macaroon::decode(&encoded).unwrap();
        assert!(decoded.verify(&root, &preimage).is_ok());
    }

    #[test]
    fn macaroon_binding_rejects_wrong_preimage() {
        let root = [1u8; 32];
        let (_preimage_a, hash_a) = preimage_and_hash();
        let macaroon_a = Macaroon::mint(&root, hash_a);

        let preimage_b = [8u8; 32];
        assert_eq!(
            macaroon_a.verify(&root, &preimage_b),
            Err(MacaroonError::PreimageMismatch)
        );
    }

    #[test]
    fn rejects_tampered_mac() {
        let root = [1u8; 32];
        let (preimage, hash) = preimage_and_hash();
        let mut m = Macaroon::mint(&root, hash);
        m.mac[0] ^= 0xFF;
        assert_eq!(m.verify(&root, &preimage), Err(MacaroonError::BadMac));
    }

    #[test]
    fn rejects_wrong_root_key() {
        let root = [1u8; 32];
        let other_root = [2u8; 32];
        let (preimage, hash) = preimage_and_hash();
        let m = Macaroon::mint(&root, hash);
        assert_eq!(m.verify(&other_root, &preimage), Err(MacaroonError::BadMac));
    }
}
