//! Timestamp coercion for records arriving from untrusted transports.
//!
//! Every transport carries timestamps as text. A value that cannot be
//! parsed is replaced by the caller-supplied "now" so the record stays
//! visible instead of being silently dropped.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parses a timestamp in any of the shapes the transports produce.
///
/// Accepted forms, in order:
/// 1. RFC 3339 (`2026-03-01T10:00:00Z`, `2026-03-01T10:00:00.123+02:00`)
/// 2. `SQLite` `datetime()` output (`2026-03-01 10:00:00`), read as UTC
/// 3. Integer milliseconds since the epoch
#[must_use]
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Parses `raw`, falling back to `now` when it is missing or unparsable.
#[must_use]
pub fn parse_or(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(parse).unwrap_or(now)
}

/// Formats a timestamp the way every transport stores it.
#[must_use]
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
