//! Lenient timestamp handling for replay records.
//!
//! The backend serializes `LocalDateTime` values without an offset, while the
//! simulator submits RFC 3339 strings. Zone-less values are read as UTC so that
//! offsets against the session start stay consistent.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

pub fn parse(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("invalid timestamp '{value}'"))
}

pub fn format(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(value))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

pub mod option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&super::format(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.trim().is_empty() => super::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_with_offset() {
        let dt = parse("2024-05-01T10:00:05+09:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 5).unwrap());
    }

    #[test]
    fn zoneless_values_are_utc() {
        let dt = parse("2024-05-01T10:00:05.250").unwrap();
        assert_eq!(dt.timestamp_millis(), Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap().timestamp_millis() + 250);
        assert!(parse("2024-05-01 10:00:05").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("yesterday").is_err());
    }

    #[test]
    fn formatting_keeps_microseconds() {
        let dt = parse("2024-05-01T10:00:01.000600").unwrap();
        assert_eq!(format(&dt), "2024-05-01T10:00:01.000600Z");
        assert_eq!(parse(&format(&dt)).unwrap(), dt);
    }
}
