//! Time ranges, granularities and aggregation-window selection.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest span a range-bounded query may cover.
pub fn max_query_span() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// Display granularity of a historical query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Raw,
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    SixHours,
    OneDay,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Raw => "raw",
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::OneHour => "1h",
            Granularity::SixHours => "6h",
            Granularity::OneDay => "1d",
        }
    }

    /// Mean window for this granularity; `Raw` has none.
    pub fn window(&self) -> Option<Duration> {
        let secs = match self {
            Granularity::Raw => return None,
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 5 * 60,
            Granularity::FifteenMinutes => 15 * 60,
            Granularity::OneHour => 60 * 60,
            Granularity::SixHours => 6 * 60 * 60,
            Granularity::OneDay => 24 * 60 * 60,
        };
        Some(Duration::from_secs(secs))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "raw" => Ok(Granularity::Raw),
            "1m" => Ok(Granularity::OneMinute),
            "5m" => Ok(Granularity::FiveMinutes),
            "15m" => Ok(Granularity::FifteenMinutes),
            "1h" => Ok(Granularity::OneHour),
            "6h" => Ok(Granularity::SixHours),
            "1d" => Ok(Granularity::OneDay),
            other => Err(Error::validation(
                "granularity",
                format!("{:?} is not one of raw, 1m, 5m, 15m, 1h, 6h, 1d", other),
            )),
        }
    }
}

/// Pick the mean window for bandwidth and ping charts.
///
/// Short look-backs stay raw; longer ones are downsampled so the result
/// set stays bounded.
pub fn select_window(span: ChronoDuration) -> Option<Duration> {
    let secs = match span.num_seconds() {
        s if s <= 12 * 3600 => return None,
        s if s <= 24 * 3600 => 2,
        s if s <= 48 * 3600 => 10,
        s if s <= 72 * 3600 => 30,
        _ => 60,
    };
    Some(Duration::from_secs(secs))
}

/// Window for the all-device traffic total, coarser than [`select_window`].
pub fn select_traffic_window(span: ChronoDuration) -> Duration {
    let secs = match span.num_seconds() {
        s if s <= 30 * 60 => 30,
        s if s <= 3600 => 60,
        s if s <= 6 * 3600 => 2 * 60,
        s if s <= 12 * 3600 => 5 * 60,
        _ => 10 * 60,
    };
    Duration::from_secs(secs)
}

/// Parse the `range` shorthand accepted by chart queries.
pub fn parse_range_shorthand(range: &str) -> Option<ChronoDuration> {
    match range {
        "10m" => Some(ChronoDuration::minutes(10)),
        "30m" => Some(ChronoDuration::minutes(30)),
        "1h" => Some(ChronoDuration::hours(1)),
        "3h" => Some(ChronoDuration::hours(3)),
        "6h" => Some(ChronoDuration::hours(6)),
        "12h" => Some(ChronoDuration::hours(12)),
        "24h" => Some(ChronoDuration::hours(24)),
        _ => None,
    }
}

/// A resolved, inclusive `[start, end]` query range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Resolve the optional `range` shorthand and explicit bounds.
    ///
    /// The shorthand is mutually exclusive with explicit bounds. A missing
    /// end means `now`; a missing start means `end - default_span`.
    pub fn resolve(
        range: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        default_span: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if let Some(range) = range.filter(|r| !r.is_empty()) {
            if start.is_some() || end.is_some() {
                return Err(Error::validation(
                    "range",
                    "cannot be combined with start_time or end_time",
                ));
            }
            let span = parse_range_shorthand(range).ok_or_else(|| {
                Error::validation(
                    "range",
                    format!("{:?} is not one of 10m, 30m, 1h, 3h, 6h, 12h, 24h", range),
                )
            })?;
            return Ok(Self {
                start: now - span,
                end: now,
            });
        }

        let end = end.unwrap_or(now);
        let start = start.unwrap_or(end - default_span);
        if start >= end {
            return Err(Error::validation("start_time", "must precede end_time"));
        }
        Ok(Self { start, end })
    }

    pub fn span(&self) -> ChronoDuration {
        self.end - self.start
    }

    /// Reject ranges wider than `max`.
    pub fn ensure_max_span(&self, max: ChronoDuration) -> Result<()> {
        if self.span() > max {
            return Err(Error::validation(
                "time_range",
                format!("span must not exceed {} hours", max.num_hours()),
            ));
        }
        Ok(())
    }

    /// Exclusive upper bound for a store query that should include `end`.
    pub fn stop(&self) -> DateTime<Utc> {
        self.end + ChronoDuration::microseconds(1)
    }
}
