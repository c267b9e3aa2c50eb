//! Timestamp utilities
//!
//! Catalog and staging tables store timestamps as RFC 3339 text with millisecond
//! precision and a `Z` suffix, so lexical order matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Format a timestamp for storage in a TEXT column
pub fn to_db_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously written by [`to_db_timestamp`]
pub fn parse_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(1500).as_millis(), 1500);
    }

    #[test]
    fn test_db_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 0).unwrap();
        let stored = to_db_timestamp(ts);
        assert_eq!(stored, "2024-03-09T17:05:00.000Z");
        assert_eq!(parse_db_timestamp(&stored).unwrap(), ts);
    }

    #[test]
    fn test_db_timestamp_lexical_order_is_chronological() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 9, 0, 0).unwrap();
        let later = earlier + ChronoDuration::milliseconds(250);
        assert!(to_db_timestamp(earlier) < to_db_timestamp(later));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_db_timestamp("yesterday").is_err());
    }
}
