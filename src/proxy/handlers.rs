//! HTTP surface (spec §4.4, §6): the axum [`Router`] wiring free routes to
//! direct responses and paid routes to the rail dispatch in [`super::lightning`]
//! / [`super::stablecoin`].

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::model::{Event, Rail};
use crate::signer::{SignedAssertion, SigningScheme, sign_assertion};
use crate::timestamp::UtcTimestamp;
use super::lightning;
use super::stablecoin::{self, AdmissionDenial, AcceptsDescriptor, PaymentDelivery};
use super::{AppState, is_free_route, resolve_route};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/pubkeys", get(pubkeys))
        .route("/v1/events", get(events_listing))
        .route("/v1/events/{pair}", get(events_listing_for_pair))
        .fallback(paid_dispatch)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn pubkeys(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ecdsa_pubkey = state.keystore.ecdsa_secret.public_key(&state.keystore.secp);
    let ed25519_pubkey = state.keystore.ed25519_signing_key.verifying_key();
    Json(json!({
        "ecdsa": hex::encode(ecdsa_pubkey.serialize()),
        "ed25519": hex::encode(ed25519_pubkey.to_bytes()),
    }))
}

async fn events_listing(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    events_for_pair(&state, None)
}

async fn events_listing_for_pair(State(state): State<Arc<AppState>>, Path(pair): Path<String>) -> impl IntoResponse {
    events_for_pair(&state, Some(pair))
}

/// The free announcement listing: pre-attestation fields only (spec §6 —
/// health, oracle-identity, and announcement-listing are free; the
/// attestation itself, once it exists, is sold behind the per-event paid
/// route). `price`/`s_values`/`attested_at` never appear here.
#[derive(serde::Serialize)]
struct EventAnnouncement {
    event_id: String,
    pair: String,
    maturity: UtcTimestamp,
    digit_count: u32,
    r_points: Vec<String>,
    missed: bool,
}

impl From<&Event> for EventAnnouncement {
    fn from(event: &Event) -> Self {
        EventAnnouncement {
            event_id: event.event_id.clone(),
            pair: event.pair.clone(),
            maturity: event.maturity,
            digit_count: event.digit_count,
            r_points: event.r_points.clone(),
            missed: event.missed,
        }
    }
}

fn events_for_pair(state: &AppState, pair: Option<String>) -> Json<serde_json::Value> {
    let Some(scheduler) = &state.scheduler else {
        return Json(json!({"events": []}));
    };
    let events: Vec<_> = match pair {
        Some(p) => scheduler.upcoming_events(&p),
        None => state
            .routes
            .values()
            .flat_map(|binding| scheduler.upcoming_events(binding.route.domain.as_str()))
            .collect(),
    };
    let announcements: Vec<EventAnnouncement> = events.iter().map(EventAnnouncement::from).collect();
    Json(json!({"events": announcements}))
}

/// What a paid request is buying: a freshly aggregated rate, or a specific
/// derivatives event's attestation once it has matured (spec §6 "scheduled
/// attestations have a templated paid route keyed by event id").
enum Resource {
    Rate,
    EventAttestation(Event),
}

/// Every route not matched above is either a configured free route (proxied
/// as a direct response, since the "backend" this service fronts is its own
/// aggregator and signer rather than a separate upstream), a per-event
/// attestation route, or a paid rate route dispatched per rail (spec §4.4
/// steps 1-8).
async fn paid_dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    let path = request.uri().path().to_string();

    if is_free_route(&state.free_routes, &path) {
        return (StatusCode::OK, Json(json!({"path": path}))).into_response();
    }

    if let Some(event_id) = attestation_event_id(&path) {
        return attestation_dispatch(&state, event_id, &headers)
            .await
            .unwrap_or_else(|e| e.into_response());
    }

    let Some(binding) = resolve_route(&state.routes, &path) else {
        return ProxyError::RouteNotFound.into_response();
    };

    match binding.route.rail {
        Rail::LightningChannel => lightning_dispatch(&state, binding, &headers, Resource::Rate).await,
        Rail::StablecoinEvm => stablecoin_dispatch(&state, binding, &headers, Resource::Rate).await,
    }
    .unwrap_or_else(|e| e.into_response())
}

/// Recognizes `/v1/events/{event_id}/attestation` without registering it as
/// an explicit axum route, which would shadow [`paid_dispatch`] the same way
/// the free announcement routes once shadowed it (spec §4.4 step 1 —
/// longest-prefix resolution over templated paths happens inside the
/// dispatcher, not in the router's route table).
fn attestation_event_id(path: &str) -> Option<&str> {
    path.strip_prefix("/v1/events/")?.strip_suffix("/attestation")
}

async fn attestation_dispatch(state: &Arc<AppState>, event_id: &str, headers: &HeaderMap) -> Result<Response, ProxyError> {
    let event = state
        .scheduler
        .as_ref()
        .and_then(|s| s.event(event_id))
        .ok_or(ProxyError::RouteNotFound)?;
    let binding = state
        .routes
        .values()
        .find(|b| b.route.domain == event.pair)
        .ok_or(ProxyError::RouteNotFound)?;

    match binding.route.rail {
        Rail::LightningChannel => lightning_dispatch(state, binding, headers, Resource::EventAttestation(event)).await,
        Rail::StablecoinEvm => stablecoin_dispatch(state, binding, headers, Resource::EventAttestation(event)).await,
    }
}

/// The DLC-style attestation body (spec §6): `price_digits` are derived from
/// `price` rather than stored separately, since the two are redundant by
/// construction.
fn attestation_body(event: &Event) -> Result<serde_json::Value, ProxyError> {
    let s_values = event.s_values.as_ref().ok_or(ProxyError::AttestationPending)?;
    let price = event.price.ok_or(ProxyError::AttestationPending)?;
    let attested_at = event.attested_at.ok_or(ProxyError::AttestationPending)?;
    let price_digits: Vec<u8> = price
        .to_string()
        .chars()
        .filter_map(|c| c.to_digit(10).map(|d| d as u8))
        .collect();
    Ok(json!({
        "event_id": event.event_id,
        "price": price,
        "price_digits": price_digits,
        "s_values": s_values,
        "attested_at": attested_at,
    }))
}

async fn lightning_dispatch(
    state: &Arc<AppState>,
    binding: &super::RouteBinding,
    headers: &HeaderMap,
    resource: Resource,
) -> Result<Response, ProxyError> {
    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());

    let Some(auth_header) = auth_header else {
        return Ok(challenge_response(state, binding).await?);
    };

    match lightning::validate_token(&state.keystore.macaroon_root_secret, auth_header) {
        Ok(()) => {}
        Err(_) => return Ok(challenge_response(state, binding).await?),
    }

    let body = match resource {
        Resource::Rate => {
            let assertion = binding
                .engine
                .aggregate()
                .await
                .map_err(|e| ProxyError::InsufficientQuorum(e.to_string()))?;
            let signed = sign_assertion(&state.keystore, &assertion, SigningScheme::Ecdsa)
                .map_err(|e| ProxyError::SignerFailure(e.to_string()))?;
            signed_body(&signed, None)
        }
        Resource::EventAttestation(event) => attestation_body(&event)?,
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn challenge_response(state: &AppState, binding: &super::RouteBinding) -> Result<Response, ProxyError> {
    let amount_sats: u64 = binding
        .route
        .price_native
        .as_deref()
        .unwrap_or("0")
        .parse()
        .map_err(|_| ProxyError::ChallengeFailed("malformed price_native".to_string()))?;
    let memo = format!("rate-oracle:{}", binding.route.path);
    let challenge = lightning::mint_challenge(
        &state.payment_node,
        &state.keystore.macaroon_root_secret,
        amount_sats * 1000,
        &memo,
    )
    .await
    .map_err(|e| ProxyError::ChallengeFailed(e.to_string()))?;

    tracing::debug!(challenge = %lightning::describe_challenge(&challenge), "minted lightning challenge");
    let mut response = (StatusCode::PAYMENT_REQUIRED, "Payment Required").into_response();
    let header_value = lightning::www_authenticate_header(&challenge);
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, header_value.parse().unwrap());
    Ok(response)
}

async fn stablecoin_dispatch(
    state: &Arc<AppState>,
    binding: &super::RouteBinding,
    headers: &HeaderMap,
    resource: Resource,
) -> Result<Response, ProxyError> {
    if !state.depeg.is_ok().await {
        return Err(ProxyError::AdmissionDenied {
            reason: "depeg".to_string(),
            retry_after_secs: None,
            terminal: false,
        });
    }

    let payment_header = headers.get("X-Payment").and_then(|v| v.to_str().ok());

    let Some(payment_header) = payment_header else {
        return Ok(stablecoin_challenge_response(state, binding));
    };

    let auth = stablecoin::parse_x_payment_header(payment_header)
        .map_err(|e| ProxyError::TokenInvalid(e.to_string()))?;

    state
        .payer_table
        .check_admission(&auth.from, now()?)
        .map_err(admission_denial_to_proxy_error)?;

    stablecoin::verify_authorization_signature(&auth).map_err(|e| ProxyError::TokenInvalid(e.to_string()))?;

    if !stablecoin::within_validity_window(&auth, now()?) {
        return Err(ProxyError::TokenInvalid("authorization outside its validity window".to_string()));
    }

    state
        .nonce_table
        .redeem(&auth.nonce, now()?)
        .map_err(|e| ProxyError::TokenReplayed(e.to_string()))?;

    let body = match resource {
        Resource::Rate => {
            let assertion = binding
                .engine
                .aggregate()
                .await
                .map_err(|e| ProxyError::InsufficientQuorum(e.to_string()))?;
            let signed = sign_assertion(&state.keystore, &assertion, SigningScheme::Ed25519)
                .map_err(|e| ProxyError::SignerFailure(e.to_string()))?;
            // Optimistic delivery: the response ships before the external
            // facilitator confirms settlement (spec §4.4 step 8).
            let delivery = PaymentDelivery {
                protocol: "x402".to_string(),
                tx_hash: format!("pending-{}", auth.nonce),
                confirmed: false,
            };
            signed_body(&signed, Some(delivery))
        }
        Resource::EventAttestation(event) => attestation_body(&event)?,
    };

    // Hand the authorization off for asynchronous settlement (spec §4.4 step
    // 5); a failure there is recorded against the payer out-of-band, never
    // against this already-delivered response.
    let settlement_state = state.clone();
    let settlement_auth = auth.clone();
    tokio::spawn(async move {
        stablecoin::submit_settlement(
            &settlement_state.http_client,
            &settlement_state.evm_rpc_url,
            &settlement_state.payer_table,
            &settlement_auth,
        )
        .await;
    });

    Ok((StatusCode::OK, Json(body)).into_response())
}

fn stablecoin_challenge_response(state: &AppState, binding: &super::RouteBinding) -> Response {
    let nonce = state
        .nonce_table
        .mint(std::time::Duration::from_secs(600), UtcTimestamp::try_now().unwrap_or(UtcTimestamp::from_unix_seconds(0)));
    let amount = binding.route.price_native.clone().unwrap_or_default();
    let accepts = AcceptsDescriptor {
        scheme: "exact".to_string(),
        network: state.stablecoin_network.clone(),
        max_amount_required: amount,
        asset: state.stablecoin_asset_address.clone(),
        pay_to: state.stablecoin_recipient.clone(),
        resource: binding.route.path.clone(),
        mime_type: "application/json".to_string(),
        description: format!("Access to {}", binding.route.path),
        max_timeout_seconds: 600,
    };
    let body = json!({ "accepts": [accepts], "nonce": nonce });
    let encoded = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        serde_json::to_vec(&json!([accepts])).unwrap_or_default(),
    );
    let mut response = (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
    response
        .headers_mut()
        .insert("Payment-Required", encoded.parse().unwrap());
    response
}

fn admission_denial_to_proxy_error(denial: AdmissionDenial) -> ProxyError {
    match denial {
        AdmissionDenial::Grace { retry_after_secs } => ProxyError::AdmissionDenied {
            reason: "grace".to_string(),
            retry_after_secs: Some(retry_after_secs),
            terminal: false,
        },
        AdmissionDenial::Blocked => ProxyError::AdmissionDenied {
            reason: "blocked".to_string(),
            retry_after_secs: None,
            terminal: true,
        },
    }
}

fn now() -> Result<UtcTimestamp, ProxyError> {
    UtcTimestamp::try_now().map_err(|e| ProxyError::SignerFailure(e.to_string()))
}

fn signed_body(signed: &SignedAssertion, payment: Option<PaymentDelivery>) -> serde_json::Value {
    let mut body = json!({
        "domain": signed.domain,
        "canonical": signed.canonical,
        "signature": signed.signature,
        "pubkey": signed.pubkey,
        "signing_scheme": signed.signing_scheme,
    });
    if let Some(payment) = payment {
        body["payment"] = json!(payment);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_body_without_payment_has_no_payment_field() {
        let signed = SignedAssertion {
            domain: "BTCUSD".to_string(),
            canonical: "v1|...".to_string(),
            signature: "sig".to_string(),
            pubkey: "pub".to_string(),
            signing_scheme: SigningScheme::Ecdsa,
        };
        let body = signed_body(&signed, None);
        assert!(body.get("payment").is_none());
    }

    #[test]
    fn signed_body_with_payment_embeds_it() {
        let signed = SignedAssertion {
            domain: "BTCUSD".to_string(),
            canonical: "v1|...".to_string(),
            signature: "sig".to_string(),
            pubkey: "pub".to_string(),
            signing_scheme: SigningScheme::Ed25519,
        };
        let delivery = PaymentDelivery {
            protocol: "x402".to_string(),
            tx_hash: "pending-abc".to_string(),
            confirmed: false,
        };
        let body = signed_body(&signed, Some(delivery));
        assert_eq!(body["payment"]["protocol"], "x402");
        assert_eq!(body["payment"]["confirmed"], false);
    }
}
