//! Payment-gated price oracle: signed exchange-rate assertions sold
//! per-query over a Lightning-channel rail and a stablecoin-EVM rail (spec
//! §1-§2).

pub mod aggregation;
pub mod config;
pub mod error;
pub mod feeds;
pub mod keystore;
pub mod model;
pub mod proxy;
pub mod schnorr;
pub mod scheduler;
pub mod signer;
pub mod sig_down;
pub mod telemetry;
pub mod timestamp;
pub mod trace_id;
