//! Error taxonomy shared across rails (spec §7), mirroring the teacher's
//! split between a domain error enum and an `IntoResponse` mapping
//! (`FacilitatorLocalError` in `handlers.rs`).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The external payment node rejected invoice creation, or nonce minting
    /// failed locally. Never retried inside the request.
    #[error("challenge creation failed: {0}")]
    ChallengeFailed(String),

    /// Macaroon MAC failed, preimage mismatched, or the stablecoin signature /
    /// authorization did not verify.
    #[error("token invalid: {0}")]
    TokenInvalid(String),

    /// Stablecoin nonce already used, or expired.
    #[error("token replayed: {0}")]
    TokenReplayed(String),

    /// Payer is in grace or blocked, or the depeg circuit breaker is tripped.
    #[error("admission denied: {0}")]
    AdmissionDenied {
        reason: String,
        retry_after_secs: Option<u64>,
        terminal: bool,
    },

    /// Aggregator could not reach the minimum source count.
    #[error("insufficient quorum: {0}")]
    InsufficientQuorum(String),

    /// Key material unreadable or the signing primitive failed. Fatal — the
    /// process should refuse to serve paid routes.
    #[error("signer failure: {0}")]
    SignerFailure(String),

    /// No route matches the request path.
    #[error("no such route")]
    RouteNotFound,

    /// The event exists but hasn't reached its maturity/attestation yet.
    #[error("event not yet attested")]
    AttestationPending,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::ChallengeFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "challenge_failed", "details": msg})),
            )
                .into_response(),
            ProxyError::TokenInvalid(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "token_invalid", "details": msg})),
            )
                .into_response(),
            ProxyError::TokenReplayed(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "nonce_used", "details": msg})),
            )
                .into_response(),
            ProxyError::AdmissionDenied {
                reason,
                retry_after_secs,
                terminal,
            } => {
                let status = if reason == "depeg" {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::FORBIDDEN
                };
                let mut body = json!({"error": "admission_denied", "reason": reason, "terminal": terminal});
                if let Some(secs) = retry_after_secs {
                    body["retry_after_secs"] = json!(secs);
                }
                (status, Json(body)).into_response()
            }
            ProxyError::InsufficientQuorum(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "insufficient_quorum", "details": msg})),
            )
                .into_response(),
            ProxyError::SignerFailure(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "signer_failure", "details": msg})),
            )
                .into_response(),
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND.into_response(),
            ProxyError::AttestationPending => (
                StatusCode::CONFLICT,
                Json(json!({"error": "attestation_pending"})),
            )
                .into_response(),
        }
    }
}
