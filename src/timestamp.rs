//! Second-resolution UTC timestamp used throughout assertions and events.
//!
//! Serialized as an ISO-8601 string with a trailing `Z`
//! (`2026-07-28T12:00:00Z`), matching the canonical string format in
//! the wire protocol (§3, §6).

use chrono::{DateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, SystemTimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTimestamp(DateTime<Utc>);

impl UtcTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self::from_unix_seconds(secs as i64))
    }

    pub fn from_unix_seconds(secs: i64) -> Self {
        let dt = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);
        UtcTimestamp(dt.trunc_subsecs(0))
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Renders as `2026-07-28T12:00:00Z` — the exact form used in the
    /// canonical assertion string and DLC-style attestation bodies.
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc);
        Ok(UtcTimestamp(dt.trunc_subsecs(0)))
    }

    pub fn add_seconds(&self, secs: i64) -> Self {
        UtcTimestamp(self.0 + chrono::Duration::seconds(secs))
    }
}

impl Display for UtcTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso8601())
    }
}

impl Serialize for UtcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<'de> Deserialize<'de> for UtcTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        UtcTimestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_iso8601() {
        let ts = UtcTimestamp::from_unix_seconds(1_800_000_000);
        let rendered = ts.to_iso8601();
        assert!(rendered.ends_with('Z'));
        let parsed = UtcTimestamp::parse(&rendered).unwrap();
        assert_eq!(ts, parsed);
    }

    #[test]
    fn truncates_to_second_resolution() {
        let ts = UtcTimestamp::from_unix_seconds(42);
        assert_eq!(ts.unix_seconds(), 42);
    }
}
