//! Core data model (spec §3): samples, assertions, routes, and the
//! canonical wire-format string that is the sole input to every signature.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timestamp::UtcTimestamp;

/// A single fetcher's observation: `{source_id, value, volume?, captured_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub source_id: String,
    pub value: Decimal,
    pub volume: Option<Decimal>,
    pub captured_at: UtcTimestamp,
}

impl Sample {
    pub fn new(source_id: impl Into<String>, value: Decimal, captured_at: UtcTimestamp) -> Self {
        Sample {
            source_id: source_id.into(),
            value,
            volume: None,
            captured_at,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// The statistical method used to derive an [`Assertion`]'s value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Median,
    Vwap,
    Cross,
    Hybrid,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Median => "median",
            Method::Vwap => "vwap",
            Method::Cross => "cross",
            Method::Hybrid => "hybrid",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Method {
    type Err = CanonicalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "median" => Ok(Method::Median),
            "vwap" => Ok(Method::Vwap),
            "cross" => Ok(Method::Cross),
            "hybrid" => Ok(Method::Hybrid),
            other => Err(CanonicalParseError::UnknownMethod(other.to_string())),
        }
    }
}

/// The signed statement of a single metric at a single point in time (spec §3).
///
/// The canonical serialization of these fields is byte-deterministic; see
/// [`Assertion::canonical`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub domain: String,
    pub value: Decimal,
    pub currency: String,
    pub decimals: u32,
    pub timestamp: UtcTimestamp,
    pub nonce: String,
    /// Lowercased, alphabetically sorted before joining into the canonical string.
    pub sources: Vec<String>,
    pub method: Method,
}

const CANONICAL_VERSION: &str = "v1";

#[derive(Debug, thiserror::Error)]
pub enum CanonicalParseError {
    #[error("expected {0} pipe-delimited fields, found {1}")]
    WrongFieldCount(usize, usize),
    #[error("unsupported canonical version {0:?}, expected {CANONICAL_VERSION:?}")]
    UnknownVersion(String),
    #[error("malformed decimal value: {0}")]
    BadDecimal(String),
    #[error("malformed decimals field: {0}")]
    BadDecimalsField(String),
    #[error("malformed timestamp: {0}")]
    BadTimestamp(#[from] chrono::ParseError),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

impl Assertion {
    /// Builds the sorted, lowercased, comma-joined canonical source list.
    fn canonical_sources(&self) -> String {
        let mut sources: Vec<String> = self.sources.iter().map(|s| s.to_lowercase()).collect();
        sources.sort();
        sources.join(",")
    }

    /// The byte-deterministic wire-format string (spec §3, §6):
    /// `v1|<domain>|<value>|<currency>|<decimals>|<timestamp>|<nonce>|<sources>|<method>`
    ///
    /// `value` is formatted with exactly `decimals` fractional digits, and
    /// `sources` are lowercased and sorted — so two equivalent assertions with
    /// differently ordered `sources` always produce identical canonical strings.
    pub fn canonical(&self) -> String {
        let value = format!("{:.*}", self.decimals as usize, self.value);
        format!(
            "{CANONICAL_VERSION}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.domain,
            value,
            self.currency,
            self.decimals,
            self.timestamp.to_iso8601(),
            self.nonce,
            self.canonical_sources(),
            self.method,
        )
    }

    /// Parses a canonical string back into field values. Pure inverse of
    /// [`Assertion::canonical`] for well-formed input (spec §8: canonicalization
    /// bijectivity — the sources field is already sorted/lowercased, so a
    /// round trip never changes it further).
    pub fn parse_canonical(s: &str) -> Result<Assertion, CanonicalParseError> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 9 {
            return Err(CanonicalParseError::WrongFieldCount(9, parts.len()));
        }
        if parts[0] != CANONICAL_VERSION {
            return Err(CanonicalParseError::UnknownVersion(parts[0].to_string()));
        }
        let decimals: u32 = parts[4]
            .parse()
            .map_err(|_| CanonicalParseError::BadDecimalsField(parts[4].to_string()))?;
        let value: Decimal = parts[2]
            .parse()
            .map_err(|_| CanonicalParseError::BadDecimal(parts[2].to_string()))?;
        let timestamp = UtcTimestamp::parse(parts[5])?;
        let sources = if parts[7].is_empty() {
            Vec::new()
        } else {
            parts[7].split(',').map(|s| s.to_string()).collect()
        };
        let method: Method = parts[8].parse()?;
        Ok(Assertion {
            domain: parts[1].to_string(),
            value,
            currency: parts[3].to_string(),
            decimals,
            timestamp,
            nonce: parts[6].to_string(),
            sources,
            method,
        })
    }
}

/// The payment rail a [`Route`] is priced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rail {
    LightningChannel,
    StablecoinEvm,
}

/// Static route configuration: `{path, backend, price_native, rail}` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub domain: String,
    pub rail: Rail,
    /// Integer minor units (e.g. sats) for the lightning rail, decimal units
    /// (e.g. USDC) for the stablecoin rail. `None` marks a free route.
    pub price_native: Option<String>,
}

/// A scheduled derivatives attestation (spec §3, §4.5). `event_id` is
/// deterministic from `pair` and `maturity`. `r_points` are published at
/// announcement time, one hex-encoded compressed point per digit position;
/// `s_values` are populated at attestation, one hex-encoded scalar per digit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub pair: String,
    pub maturity: UtcTimestamp,
    pub digit_count: u32,
    pub r_points: Vec<String>,
    pub s_values: Option<Vec<String>>,
    pub price: Option<i64>,
    pub attested_at: Option<UtcTimestamp>,
    /// Set by the scheduler's recovery pass for an event past maturity
    /// without `s_values` outside the retry grace window (spec §9: terminal
    /// and surfaced to operators, not retried indefinitely).
    pub missed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_assertion() -> Assertion {
        Assertion {
            domain: "BTCUSD".to_string(),
            value: Decimal::from_str("69004.50").unwrap(),
            currency: "USD".to_string(),
            decimals: 2,
            timestamp: UtcTimestamp::from_unix_seconds(1_800_000_000),
            nonce: "abc123".to_string(),
            sources: vec!["B".to_string(), "a".to_string(), "C".to_string()],
            method: Method::Median,
        }
    }

    #[test]
    fn canonical_bijectivity() {
        let a = sample_assertion();
        let canonical = a.canonical();
        let parsed = Assertion::parse_canonical(&canonical).unwrap();
        assert_eq!(parsed.domain, a.domain);
        assert_eq!(parsed.value, a.value);
        assert_eq!(parsed.currency, a.currency);
        assert_eq!(parsed.decimals, a.decimals);
        assert_eq!(parsed.timestamp, a.timestamp);
        assert_eq!(parsed.nonce, a.nonce);
        assert_eq!(parsed.sources, vec!["a", "b", "c"]);
        assert_eq!(parsed.method, a.method);
    }

    #[test]
    fn sort_and_format_determinism() {
        let mut a = sample_assertion();
        let mut b = a.clone();
        b.sources = vec!["c".to_string(), "A".to_string(), "b".to_string()];
        a.sources = vec!["a".to_string(), "b".to_string(), "C".to_string()];
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn value_formatted_with_exact_decimals() {
        let mut a = sample_assertion();
        a.value = Decimal::from_str("69004.5").unwrap();
        assert!(a.canonical().contains("|69004.50|"));
    }
}
