use chrono::{DateTime, SecondsFormat, Utc};

// Re-export UserRole and Permission from the permission module
pub use crate::domains::permission::{UserRole, Permission};

use crate::errors::DbError;

/// Canonical textual form for every timestamp we persist.
///
/// Fixed width (millisecond precision, `Z` suffix) so that SQLite string
/// comparison orders values chronologically.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp column written by [`format_timestamp`] (any RFC 3339 value is accepted).
pub fn parse_timestamp(table: &str, value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::corrupt(table, format!("bad timestamp '{}': {}", value, e)))
}

pub fn parse_optional_timestamp(table: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, DbError> {
    value.map(|v| parse_timestamp(table, v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(format_timestamp(&late), "2025-01-10T00:00:00.000Z");
    }

    #[test]
    fn parse_accepts_offsets_and_normalizes_to_utc() {
        let parsed = parse_timestamp("t", "2025-03-01T10:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap());
        assert!(parse_timestamp("t", "yesterday").is_err());
    }
}
