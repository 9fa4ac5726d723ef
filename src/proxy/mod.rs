//! Payment-Gating Proxy (spec §4.4): the single externally reachable surface.
//! Resolves a route, short-circuits free routes, and otherwise dispatches
//! into the rail-specific submodule that mints challenges and validates
//! tokens before handing off to the route's aggregation engine and signer.

pub mod handlers;
pub mod lightning;
pub mod macaroon;
pub mod stablecoin;

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregation::AggregationEngine;
use crate::keystore::Keystore;
use crate::model::{Rail, Route};
use crate::scheduler::Scheduler;
use lightning::PaymentNodeClient;
use stablecoin::{DepegTracker, NonceTable, PayerTable};

/// A configured paid route bound to the engine and rail state that serve it.
pub struct RouteBinding {
    pub route: Route,
    pub engine: Arc<AggregationEngine>,
}

/// Shared, constructed-once state threaded through every request handler
/// (Design Note §9: "global mutable singletons → explicit service object").
pub struct AppState {
    pub keystore: Arc<Keystore>,
    pub routes: HashMap<String, RouteBinding>,
    pub free_routes: std::collections::HashSet<String>,
    pub payment_node: PaymentNodeClient,
    pub nonce_table: NonceTable,
    pub payer_table: PayerTable,
    pub depeg: DepegTracker,
    pub scheduler: Option<Arc<Scheduler>>,
    pub stablecoin_recipient: String,
    pub stablecoin_asset_address: String,
    pub stablecoin_network: String,
    /// Facilitator endpoint the settlement submitter posts signed
    /// authorizations to (spec §4.4 step 5 "submit ... for settlement
    /// asynchronously").
    pub evm_rpc_url: url::Url,
    pub http_client: reqwest::Client,
}

/// Exact-path match first, then longest-prefix over the remaining templated
/// entries (spec §4.4 step 1 — e.g. per-event attestation routes keyed by id).
pub fn resolve_route<'a>(routes: &'a HashMap<String, RouteBinding>, path: &str) -> Option<&'a RouteBinding> {
    if let Some(binding) = routes.get(path) {
        return Some(binding);
    }
    routes
        .iter()
        .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, binding)| binding)
}

pub fn is_free_route(free_routes: &std::collections::HashSet<String>, path: &str) -> bool {
    free_routes.contains(path)
}

pub fn rail_of(binding: &RouteBinding) -> Rail {
    binding.route.rail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationEngine;
    use std::time::Duration;

    fn dummy_binding(path: &str, domain: &str) -> RouteBinding {
        RouteBinding {
            route: Route {
                path: path.to_string(),
                domain: domain.to_string(),
                rail: Rail::LightningChannel,
                price_native: Some("1000".to_string()),
            },
            engine: Arc::new(AggregationEngine::direct_median(
                domain,
                "USD",
                2,
                vec![],
                1,
                Duration::from_secs(3),
            )),
        }
    }

    #[test]
    fn exact_path_wins_over_a_shorter_prefix() {
        let mut routes = HashMap::new();
        routes.insert("/v1/events".to_string(), dummy_binding("/v1/events", "PREFIX"));
        routes.insert(
            "/v1/events/123".to_string(),
            dummy_binding("/v1/events/123", "EXACT"),
        );
        let hit = resolve_route(&routes, "/v1/events/123").unwrap();
        assert_eq!(hit.route.domain, "EXACT");
    }

    #[test]
    fn longest_prefix_wins_when_no_exact_match() {
        let mut routes = HashMap::new();
        routes.insert("/v1/events".to_string(), dummy_binding("/v1/events", "SHORT"));
        routes.insert(
            "/v1/events/attest".to_string(),
            dummy_binding("/v1/events/attest", "LONG"),
        );
        let hit = resolve_route(&routes, "/v1/events/attest/BTCUSD-1800003600").unwrap();
        assert_eq!(hit.route.domain, "LONG");
    }

    #[test]
    fn unmatched_path_resolves_to_none() {
        let routes = HashMap::new();
        assert!(resolve_route(&routes, "/nope").is_none());
    }
}
