//! Serde adapter for durations stored in configuration records
//!
//! Serialises with `humantime` ("1m 30s"); deserialises either a humantime
//! string or a bare integer number of seconds, which is how most API
//! clients send TTLs.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Seconds(u64),
    Text(String),
}

/// Serialize a duration as a humantime string
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime_serde::serialize(duration, serializer)
}

/// Deserialize a duration from seconds or a humantime string
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Repr::deserialize(deserializer)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse `"90"`, `"90s"`, `"1h 30m"` and friends
pub fn parse(text: &str) -> Result<Duration, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime_serde::re::humantime::parse_duration(trimmed)
        .map_err(|e| format!("invalid duration '{trimmed}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        ttl: Duration,
    }

    #[test]
    fn accepts_integer_seconds() {
        let h: Holder = serde_json::from_str(r#"{"ttl": 30}"#).unwrap();
        assert_eq!(h.ttl, Duration::from_secs(30));
    }

    #[test]
    fn accepts_humantime() {
        let h: Holder = serde_json::from_str(r#"{"ttl": "1m 30s"}"#).unwrap();
        assert_eq!(h.ttl, Duration::from_secs(90));
        let h: Holder = serde_json::from_str(r#"{"ttl": "45"}"#).unwrap();
        assert_eq!(h.ttl, Duration::from_secs(45));
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"ttl": "soon"}"#).is_err());
    }

    #[test]
    fn roundtrips_through_humantime() {
        let json = serde_json::to_string(&Holder {
            ttl: Duration::from_secs(3600),
        })
        .unwrap();
        assert_eq!(json, r#"{"ttl":"1h"}"#);
    }
}
