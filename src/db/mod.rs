//! Storage adapters for netpulse.
//!
//! Three backends sit behind traits so services only see narrow handles:
//! the time-series store, the hot cache and the relational device registry.
//! Each ships with one concrete implementation (SQLite or in-memory).

mod cache;
mod devices;
pub mod keys;
mod models;
mod predicate;
mod tsdb;

pub use cache::*;
pub use devices::*;
pub use models::*;
pub use predicate::*;
pub use tsdb::*;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid tag key: {0:?}")]
    InvalidTag(String),
    #[error("Store is closed")]
    Closed,
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Format a datetime for the relational store.
pub(crate) fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the relational store or the cache.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try ISO 8601 first, it is what the cache holds
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Bare unix seconds
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_db_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();

        assert_eq!(parse_db_time("2024-01-01 12:34:56"), Some(expected));
        assert_eq!(parse_db_time("2024-01-01T12:34:56Z"), Some(expected));
        assert_eq!(parse_db_time("2024-01-01T14:34:56+02:00"), Some(expected));
        assert_eq!(parse_db_time(&format_db_time(expected)), Some(expected));
        assert_eq!(parse_db_time("1704112496"), Some(expected));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
