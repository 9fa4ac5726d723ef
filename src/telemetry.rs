//! Structured logging bootstrap.
//!
//! Mirrors the teacher's `Telemetry` builder shape (`with_name` / `with_version`
//! / `register`) but drops the OpenTelemetry OTLP export path: this service has
//! no external trace collector in scope, so we keep only the `tracing-subscriber`
//! `EnvFilter` + `fmt` layer. `RUST_LOG` controls verbosity as usual.

use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: "rate-oracle",
            version: "0.0.0",
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Installs the global tracing subscriber. Returns `self` so the caller
    /// can keep it alive for the lifetime of the process if needed.
    pub fn register(self) -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        tracing::info!(name = self.name, version = self.version, "starting");
        self
    }

    /// Per-request access-log spans, layered onto the Axum router.
    pub fn http_tracing(&self) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
