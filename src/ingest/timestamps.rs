//! Timestamp back-fill for batched pushes.
//!
//! Agents may send a batch of points without timestamps. The last point is
//! taken as "now" and earlier points are spaced backwards by the collector
//! interval. The interval is the configured push step, not the device's own
//! sampling rate, so a device sampling at a different cadence gets
//! approximate timestamps.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Assign a timestamp to every batch element.
///
/// Explicit timestamps win; missing ones become
/// `now - (len - 1 - index) * interval`, clamped at the earliest
/// representable time.
pub fn backfill_timestamps(
    explicit: &[Option<DateTime<Utc>>],
    now: DateTime<Utc>,
    interval: ChronoDuration,
) -> Vec<DateTime<Utc>> {
    let last = explicit.len().saturating_sub(1);
    explicit
        .iter()
        .enumerate()
        .map(|(i, ts)| {
            ts.unwrap_or_else(|| {
                i32::try_from(last - i)
                    .ok()
                    .and_then(|steps| interval.checked_mul(steps))
                    .and_then(|back| now.checked_sub_signed(back))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            })
        })
        .collect()
}

/// Convert agent milliseconds to a timestamp.
pub fn from_millis(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp_ms)
}
