//! Lightning-channel rail (spec §3, §4.4 steps 3-5, 8): invoice creation
//! against the external payment node, macaroon minting, and token validation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Deserialize;

use crate::proxy::macaroon::{self, Macaroon, MacaroonError};

#[derive(Debug, thiserror::Error)]
pub enum LightningError {
    #[error("payment node request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment node returned unexpected status {0}")]
    HttpStatus(u16),
    #[error("payment node response did not parse: {0}")]
    Parse(String),
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    payment_request: String,
    #[serde(with = "hex::serde")]
    r_hash: [u8; 32],
}

/// Thin client over the external Lightning node's invoice-creation API
/// (spec §1 — out of scope, treated as an external collaborator with a
/// defined HTTPS-plus-bearer-credential contract).
pub struct PaymentNodeClient {
    base_url: url::Url,
    credential: String,
    client: reqwest::Client,
}

impl PaymentNodeClient {
    pub fn new(base_url: url::Url, credential: String) -> Self {
        PaymentNodeClient {
            base_url,
            credential,
            client: reqwest::Client::new(),
        }
    }

    /// Calls the node's invoice-creation endpoint with the route's price
    /// (integer minor units, e.g. sats) and a short-lived memo identifying
    /// the route. Returns the opaque invoice string and its 32-byte payment
    /// hash.
    pub async fn create_invoice(&self, amount_msat: u64, memo: &str) -> Result<(String, [u8; 32]), LightningError> {
        let url = self
            .base_url
            .join("v1/invoices")
            .map_err(|e| LightningError::Parse(e.to_string()))?;
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.credential))
            .json(&serde_json::json!({ "value_msat": amount_msat, "memo": memo }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LightningError::HttpStatus(response.status().as_u16()));
        }
        let parsed: CreateInvoiceResponse = response
            .json()
            .await
            .map_err(|e| LightningError::Parse(e.to_string()))?;
        Ok((parsed.payment_request, parsed.r_hash))
    }
}

/// A minted challenge ready to become a 402 response (spec §4.4 step 4).
pub struct Challenge {
    pub invoice: String,
    pub macaroon_b64: String,
}

/// Creates the invoice, strictly before minting the macaroon that binds to
/// its payment hash (spec §5 ordering).
pub async fn mint_challenge(
    node: &PaymentNodeClient,
    root_secret: &[u8; 32],
    amount_msat: u64,
    memo: &str,
) -> Result<Challenge, LightningError> {
    let (invoice, payment_hash) = node.create_invoice(amount_msat, memo).await?;
    let macaroon = Macaroon::mint(root_secret, payment_hash);
    Ok(Challenge {
        invoice,
        macaroon_b64: macaroon.encode(),
    })
}

/// Renders the `WWW-Authenticate: L402 macaroon="...", invoice="..."` header
/// value for a minted challenge.
pub fn www_authenticate_header(challenge: &Challenge) -> String {
    format!(
        "L402 macaroon=\"{}\", invoice=\"{}\"",
        challenge.macaroon_b64, challenge.invoice
    )
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing or malformed Authorization header")]
    MissingOrMalformed,
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),
}

/// Validates a presented `Authorization: L402 <macaroon>:<preimage_hex>`
/// header. No call back to the payment node is required — the preimage is
/// itself proof of payment to whichever node issued the invoice (spec §4.4
/// step 5).
pub fn validate_token(root_secret: &[u8; 32], header_value: &str) -> Result<(), TokenError> {
    let (macaroon, preimage) =
        macaroon::parse_authorization_header(header_value).ok_or(TokenError::MissingOrMalformed)?;
    macaroon.verify(root_secret, &preimage)?;
    Ok(())
}

/// Re-encodes a challenge's `Payment-Required`-equivalent header contents as
/// a display string; kept distinct from [`www_authenticate_header`] so a
/// caller logging a challenge never accidentally logs the raw invoice twice.
pub fn describe_challenge(challenge: &Challenge) -> String {
    b64.encode(format!("{}:{}", challenge.macaroon_b64, challenge.invoice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn www_authenticate_header_carries_macaroon_and_invoice() {
        let root = [3u8; 32];
        let preimage = [5u8; 32];
        let hash: [u8; 32] = Sha256::digest(preimage).into();
        let macaroon = Macaroon::mint(&root, hash);
        let challenge = Challenge {
            invoice: "lnbc1...".to_string(),
            macaroon_b64: macaroon.encode(),
        };
        let header = www_authenticate_header(&challenge);
        assert!(header.starts_with("L402 macaroon=\""));
        assert!(header.contains("lnbc1..."));
    }

    #[test]
    fn validate_token_accepts_matching_preimage_and_rejects_wrong_one() {
        let root = [3u8; 32];
        let preimage = [5u8; 32];
        let hash: [u8; 32] = Sha256::digest(preimage).into();
        let macaroon = Macaroon::mint(&root, hash);
        let header = format!("L402 {}:{}", macaroon.encode(), hex::encode(preimage));
        assert!(validate_token(&root, &header).is_ok());

        let wrong_preimage = [6u8; 32];
        let bad_header = format!("L402 {}:{}", macaroon.encode(), hex::encode(wrong_preimage));
        assert!(validate_token(&root, &bad_header).is_err());
    }

    #[test]
    fn validate_token_rejects_missing_header() {
        let root = [3u8; 32];
        assert!(matches!(
            validate_token(&root, "garbage"),
            Err(TokenError::MissingOrMalformed)
        ));
    }
}
