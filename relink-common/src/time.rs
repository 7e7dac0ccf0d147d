//! Timestamp utilities
//!
//! All durable timestamps are stored as RFC3339 UTC text with a fixed
//! microsecond width and `Z` suffix. The fixed width keeps the stored text
//! lexicographically ordered the same way as the underlying instants, which
//! the queue availability and sweeper staleness cutoff queries rely on.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for database storage
pub fn to_db_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current timestamp in database storage format
pub fn now_db_timestamp() -> String {
    to_db_timestamp(&Utc::now())
}

/// Parse a stored database timestamp
pub fn parse_db_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidValue(format!("timestamp '{}': {}", s, e)))
}

/// Parse an optional stored timestamp column
pub fn parse_opt_db_timestamp(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_db_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_round_trip() {
        let t = now();
        let stored = to_db_timestamp(&t);
        let parsed = parse_db_timestamp(&stored).unwrap();
        // Stored precision is microseconds
        assert_eq!(parsed.timestamp_micros(), t.timestamp_micros());
    }

    #[test]
    fn test_lexicographic_order_matches_chronological() {
        let base = now();
        let earlier = to_db_timestamp(&(base - Duration::seconds(90)));
        let later = to_db_timestamp(&(base + Duration::seconds(90)));
        assert!(earlier < later);
        // Sub-second ordering also holds because the width is fixed
        let a = to_db_timestamp(&(base + Duration::microseconds(1)));
        let b = to_db_timestamp(&(base + Duration::microseconds(20)));
        assert!(a < b);
    }

    #[test]
    fn test_fixed_width() {
        let t = parse_db_timestamp("2024-01-01T00:00:00Z").unwrap();
        let stored = to_db_timestamp(&t);
        assert_eq!(stored, "2024-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        assert!(parse_db_timestamp("not a timestamp").is_err());
        assert!(parse_opt_db_timestamp(Some("garbage")).is_err());
        assert_eq!(parse_opt_db_timestamp(None).unwrap(), None);
    }
}
