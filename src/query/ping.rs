//! Loss-aware ping series.
//!
//! Averaging latency over a window would erase packet loss, since a lost
//! ping is stored as latency 0. Statistics are therefore always computed
//! from raw samples, and every loss is re-inserted at its exact timestamp
//! next to the smoothed successful samples.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{keys, Record};
use crate::ingest::{ping_series_key, PingStatus};

/// Identity of one ping series: target plus optional source interface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesId {
    pub target_address: String,
    pub source_interface: String,
}

impl SeriesId {
    fn of(record: &Record) -> Self {
        Self {
            target_address: record.tag(keys::TAG_TARGET_ADDRESS).unwrap_or_default().to_string(),
            source_interface: record.tag(keys::TAG_SOURCE_INTERFACE).unwrap_or_default().to_string(),
        }
    }

    pub fn key(&self) -> String {
        ping_series_key(&self.target_address, &self.source_interface)
    }
}

/// A raw ping sample rebuilt from its latency and status records.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPing {
    pub time: DateTime<Utc>,
    pub latency: f64,
    pub status: Option<String>,
}

impl RawPing {
    pub fn is_loss(&self) -> bool {
        self.status.as_deref() == Some(PingStatus::Down.as_str()) || self.latency == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingPoint {
    pub timestamp: DateTime<Utc>,
    pub latency: f64,
    pub is_loss: bool,
}

impl PingPoint {
    fn from_raw(raw: &RawPing) -> Self {
        let is_loss = raw.is_loss();
        Self {
            timestamp: raw.time,
            latency: if is_loss { 0.0 } else { raw.latency },
            is_loss,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingStats {
    pub total_count: usize,
    pub loss_count: usize,
    /// Percentage of lost pings.
    pub loss_rate: f64,
    /// Latency statistics over successful pings only.
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
}

/// Compute loss and latency statistics from raw samples.
pub fn ping_stats(samples: &[RawPing]) -> PingStats {
    let total_count = samples.len();
    let latencies: Vec<f64> = samples
        .iter()
        .filter(|s| !s.is_loss())
        .map(|s| s.latency)
        .collect();
    let loss_count = total_count - latencies.len();

    let loss_rate = if total_count == 0 {
        0.0
    } else {
        loss_count as f64 / total_count as f64 * 100.0
    };
    let avg_latency = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    };

    PingStats {
        total_count,
        loss_count,
        loss_rate,
        avg_latency,
        min_latency: latencies.iter().copied().reduce(f64::min),
        max_latency: latencies.iter().copied().reduce(f64::max),
    }
}

/// Build the displayed series for one target.
///
/// Without `smoothed` the raw samples are returned as-is. With it, the
/// smoothed successful samples are joined by every raw loss point, unchanged
/// and at its original timestamp.
pub fn merge_loss_aware(raw: &[RawPing], smoothed: Option<Vec<PingPoint>>) -> Vec<PingPoint> {
    let Some(mut points) = smoothed else {
        return raw.iter().map(PingPoint::from_raw).collect();
    };

    points.extend(raw.iter().filter(|s| s.is_loss()).map(PingPoint::from_raw));
    points.sort_by_key(|p| p.timestamp);
    points
}

/// Rebuild raw samples from per-field records, grouped by series and
/// ordered by time.
pub fn group_raw(records: Vec<Record>) -> BTreeMap<SeriesId, Vec<RawPing>> {
    let mut series: BTreeMap<SeriesId, BTreeMap<DateTime<Utc>, RawPing>> = BTreeMap::new();

    for record in records {
        let sample = series
            .entry(SeriesId::of(&record))
            .or_default()
            .entry(record.time)
            .or_insert_with(|| RawPing {
                time: record.time,
                latency: 0.0,
                status: None,
            });
        match record.field.as_str() {
            keys::FIELD_LATENCY => sample.latency = record.value.as_f64().unwrap_or(0.0),
            keys::FIELD_STATUS => sample.status = record.value.as_str().map(str::to_string),
            _ => {}
        }
    }

    series
        .into_iter()
        .map(|(id, samples)| (id, samples.into_values().collect()))
        .collect()
}

/// Group windowed latency means by series.
pub fn group_smoothed(records: Vec<Record>) -> BTreeMap<SeriesId, Vec<PingPoint>> {
    let mut series: BTreeMap<SeriesId, Vec<PingPoint>> = BTreeMap::new();
    for record in records {
        let Some(latency) = record.value.as_f64() else {
            continue;
        };
        series.entry(SeriesId::of(&record)).or_default().push(PingPoint {
            timestamp: record.time,
            latency,
            is_loss: false,
        });
    }
    series
}
