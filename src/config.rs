//! Typed configuration for the oracle process (spec §6).
//!
//! Loaded once at startup from a JSON file (`--config` / `CONFIG` env var),
//! following the teacher's `Config::load()` shape. Unknown top-level keys are
//! rejected — a dynamic dict-based config is exactly what Design Note §9 says
//! to replace with a typed record.

use clap::Parser;
use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::model::Route;

#[derive(Parser, Debug)]
#[command(name = "rate-oracle")]
#[command(about = "Payment-gated price oracle")]
struct CliArgs {
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// A value that may be given literally or as a `$VAR` / `${VAR}` environment
/// variable reference, resolved at deserialization time. Used for anything
/// that plausibly carries a secret or host-specific value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(pub T);

impl<T> std::ops::Deref for LiteralOrEnv<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> LiteralOrEnv<T> {
    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(inner) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            Some(inner.to_string())
        } else if let Some(name) = s.strip_prefix('$') {
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                D::Error::custom(format!(
                    "environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| D::Error::custom(format!("failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Process-wide recognized options (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "defaults::host")]
    pub host: std::net::IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,

    pub payment_node_base_url: LiteralOrEnv<url::Url>,
    pub payment_node_credential_path: PathBuf,
    #[serde(default = "defaults::keystore_dir")]
    pub keystore_dir: PathBuf,

    pub route_table: Vec<Route>,
    #[serde(default)]
    pub free_route_table: Vec<String>,

    pub stablecoin_recipient_address: String,
    pub evm_rpc_url: LiteralOrEnv<url::Url>,
    #[serde(default = "defaults::stablecoin_asset_address")]
    pub stablecoin_asset_address: String,
    #[serde(default = "defaults::stablecoin_network")]
    pub stablecoin_network: String,

    #[serde(default = "defaults::depeg_tolerance")]
    pub depeg_tolerance: Decimal,
    #[serde(default = "defaults::grace_cooldown_secs")]
    pub grace_cooldown_secs: u64,
    #[serde(default = "defaults::blocked_threshold")]
    pub blocked_threshold: u32,
    #[serde(default = "defaults::blocked_window_secs")]
    pub blocked_window_secs: u64,
    #[serde(default = "defaults::fetch_deadline_secs")]
    pub fetch_deadline_secs: u64,
    #[serde(default = "defaults::attestation_schedule_secs")]
    pub attestation_schedule_secs: u64,
    #[serde(default = "defaults::announcement_horizon_secs")]
    pub announcement_horizon_secs: u64,
    #[serde(default = "defaults::digit_count")]
    pub digit_count: u32,
    #[serde(default = "defaults::attestation_grace_secs")]
    pub attestation_grace_secs: u64,

    #[serde(default = "defaults::stablecoin_divergence_tolerance")]
    pub stablecoin_divergence_tolerance: Decimal,
    #[serde(default = "defaults::vwap_window_secs")]
    pub vwap_window_secs: u64,
}

mod defaults {
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    pub fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
    }
    pub fn port() -> u16 {
        8402
    }
    pub fn keystore_dir() -> PathBuf {
        PathBuf::from("./keystore")
    }
    pub fn depeg_tolerance() -> Decimal {
        Decimal::from_f64(0.02).unwrap()
    }
    pub fn grace_cooldown_secs() -> u64 {
        600
    }
    pub fn blocked_threshold() -> u32 {
        10
    }
    pub fn blocked_window_secs() -> u64 {
        7 * 24 * 3600
    }
    pub fn fetch_deadline_secs() -> u64 {
        5
    }
    pub fn attestation_schedule_secs() -> u64 {
        3600
    }
    pub fn announcement_horizon_secs() -> u64 {
        24 * 3600
    }
    pub fn digit_count() -> u32 {
        5
    }
    pub fn attestation_grace_secs() -> u64 {
        300
    }
    pub fn stablecoin_divergence_tolerance() -> Decimal {
        Decimal::from_f64(0.005).unwrap()
    }
    pub fn vwap_window_secs() -> u64 {
        300
    }
    pub fn stablecoin_asset_address() -> String {
        "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string()
    }
    pub fn stablecoin_network() -> String {
        "base".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(&cli_args.config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
