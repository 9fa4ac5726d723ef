//! Attestation Signer (spec §4.3): a pure transformation
//! `(Assertion, Scheme) -> {canonical, signature_b64, pubkey_hex}`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use ed25519_dalek::Signer as _;
use secp256k1::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keystore::Keystore;
use crate::model::Assertion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningScheme {
    Ecdsa,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAssertion {
    pub domain: String,
    pub canonical: String,
    pub signature: String,
    pub pubkey: String,
    pub signing_scheme: SigningScheme,
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("message hash was not a valid curve scalar: {0}")]
    InvalidMessage(#[from] secp256k1::Error),
}

/// Canonicalizes an assertion and signs it under the rail-appropriate scheme.
/// Both keys are loaded once from the [`Keystore`] and never rotated within
/// the process lifetime.
pub fn sign_assertion(
    keystore: &Keystore,
    assertion: &Assertion,
    scheme: SigningScheme,
) -> Result<SignedAssertion, SignerError> {
    let canonical = assertion.canonical();
    let digest = Sha256::digest(canonical.as_bytes());

    let (signature_bytes, pubkey_hex) = match scheme {
        SigningScheme::Ecdsa => {
            let message = Message::from_digest(digest.into());
            let sig = keystore.secp.sign_ecdsa(message, &keystore.ecdsa_secret);
            let pubkey = keystore.ecdsa_secret.public_key(&keystore.secp);
            (sig.serialize_der().to_vec(), hex::encode(pubkey.serialize()))
        }
        SigningScheme::Ed25519 => {
            let sig = keystore.ed25519_signing_key.sign(&digest);
            let verifying_key = keystore.ed25519_signing_key.verifying_key();
            (sig.to_bytes().to_vec(), hex::encode(verifying_key.to_bytes()))
        }
    };

    Ok(SignedAssertion {
        domain: assertion.domain.clone(),
        canonical,
        signature: b64.encode(signature_bytes),
        pubkey: pubkey_hex,
        signing_scheme: scheme,
    })
}

/// Verifies a [`SignedAssertion`] under its published scheme. Used by tests
/// standing in for an independent client verifier (spec §8).
pub fn verify_signature(signed: &SignedAssertion) -> bool {
    let digest = Sha256::digest(signed.canonical.as_bytes());
    let Ok(signature_bytes) = b64.decode(&signed.signature) else {
        return false;
    };
    let Ok(pubkey_bytes) = hex::decode(&signed.pubkey) else {
        return false;
    };

    match signed.signing_scheme {
        SigningScheme::Ecdsa => {
            let secp = secp256k1::Secp256k1::verification_only();
            let Ok(sig) = secp256k1::ecdsa::Signature::from_der(&signature_bytes) else {
                return false;
            };
            let Ok(pubkey) = secp256k1::PublicKey::from_slice(&pubkey_bytes) else {
                return false;
            };
            let message = Message::from_digest(digest.into());
            secp.verify_ecdsa(message, &sig, &pubkey).is_ok()
        }
        SigningScheme::Ed25519 => {
            let Ok(pubkey_arr): Result<[u8; 32], _> = pubkey_bytes.try_into() else {
                return false;
            };
            let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&pubkey_arr) else {
                return false;
            };
            let Ok(sig_arr): Result<[u8; 64], _> = signature_bytes.try_into() else {
                return false;
            };
            let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
            verifying_key.verify_strict(&digest, &sig).is_ok()
        }
    }
}
