//! Historical query engine.
//!
//! All paths read the time-series store through [`SeriesQuery`] and shape
//! the per-field records into caller-facing points.

mod pagination;
mod ping;
mod window;

pub use pagination::*;
pub use ping::*;
pub use window::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{
    is_valid_tag_key, keys, CacheClient, Device, DeviceRepository, DeviceStatus, MetricValue, Predicate,
    SeriesQuery, TimeSeriesClient,
};
use crate::error::{Error, Result};
use crate::ingest::PingSnapshot;
use crate::scheduler::LivenessEvaluator;

/// Generic history request.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub device_id: Option<i64>,
    /// Restrict to these metrics; empty means all.
    pub metrics: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub range: Option<String>,
    pub granularity: Option<String>,
    /// Extra tag equality filters, joined by AND.
    pub tags: BTreeMap<String, String>,
    pub page: i64,
    pub limit: i64,
}

/// All fields written at one timestamp, recombined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub device_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: String,
    pub points: Vec<DataPoint>,
    pub pagination: Pagination,
}

/// Bounds shared by the chart queries.
#[derive(Debug, Clone, Default)]
pub struct ChartRequest {
    pub range: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandwidthPoint {
    pub timestamp: DateTime<Utc>,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthHistory {
    pub device_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Mean window in seconds; absent for raw data.
    pub window_secs: Option<u64>,
    pub interfaces: BTreeMap<String, Vec<BandwidthPoint>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingSeries {
    pub target_address: String,
    pub source_interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub stats: PingStats,
    pub points: Vec<PingPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingHistory {
    pub device_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_secs: Option<u64>,
    /// Keyed by target, or `target_iface` when a source interface is set.
    pub targets: BTreeMap<String, PingSeries>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrafficPoint {
    pub timestamp: DateTime<Utc>,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalTraffic {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_secs: u64,
    pub points: Vec<TrafficPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub device_id: i64,
    pub metric: String,
    pub window_secs: i64,
    pub mean: Option<f64>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusEntry {
    pub device_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Read side of the pipeline.
#[derive(Clone)]
pub struct QueryEngine {
    series: Arc<dyn TimeSeriesClient>,
    cache: Arc<dyn CacheClient>,
    devices: Arc<dyn DeviceRepository>,
    liveness: LivenessEvaluator,
}

impl QueryEngine {
    /// `liveness` should carry the relaxed status-read timeout.
    pub fn new(
        series: Arc<dyn TimeSeriesClient>,
        cache: Arc<dyn CacheClient>,
        devices: Arc<dyn DeviceRepository>,
        liveness: LivenessEvaluator,
    ) -> Self {
        Self {
            series,
            cache,
            devices,
            liveness,
        }
    }

    /// Query generic metrics for one device, paginated in memory.
    pub async fn query_historical_data(&self, request: &HistoryRequest) -> Result<HistoryResponse> {
        let device_id = match request.device_id {
            Some(id) if id > 0 => id,
            Some(_) => return Err(Error::validation("device_id", "must be a positive integer")),
            None => return Err(Error::validation("device_id", "is required")),
        };
        let granularity: Granularity = request.granularity.as_deref().unwrap_or("raw").parse()?;
        if request.page < 0 {
            return Err(Error::validation("page", "must not be negative"));
        }
        if !(0..=MAX_LIMIT).contains(&request.limit) {
            return Err(Error::validation(
                "limit",
                format!("must be between 0 and {}", MAX_LIMIT),
            ));
        }
        if let Some(key) = request.tags.keys().find(|k| !is_valid_tag_key(k)) {
            return Err(Error::validation("tags", format!("{:?} is not a valid tag name", key)));
        }
        let range = TimeRange::resolve(
            request.range.as_deref(),
            request.start_time,
            request.end_time,
            ChronoDuration::hours(24),
            Utc::now(),
        )?;

        self.ensure_device(device_id).await?;

        let mut predicate = Predicate::new().tag(keys::TAG_DEVICE_ID, device_id.to_string());
        for (k, v) in &request.tags {
            predicate = predicate.tag(k.clone(), v.clone());
        }
        let query = SeriesQuery::new(keys::MEASUREMENT_METRICS, range.start, range.stop())
            .filter(predicate)
            .fields(request.metrics.iter().cloned())
            .window(granularity.window());
        tracing::debug!("Query: {}", query);

        let records = self.series.query(&query).await?;

        let mut grouped: BTreeMap<DateTime<Utc>, BTreeMap<String, MetricValue>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.time).or_default().insert(record.field, record.value);
        }
        let points = grouped
            .into_iter()
            .map(|(timestamp, values)| DataPoint { timestamp, values })
            .collect();
        let (points, pagination) = paginate(points, request.page, request.limit);

        Ok(HistoryResponse {
            device_id,
            start: range.start,
            end: range.end,
            granularity: granularity.to_string(),
            points,
            pagination,
        })
    }

    /// Bandwidth per interface, windowed by span.
    pub async fn query_bandwidth(
        &self,
        device_id: i64,
        interface: Option<&str>,
        request: &ChartRequest,
    ) -> Result<BandwidthHistory> {
        let range = chart_range(request)?;
        self.ensure_device(device_id).await?;

        let window = select_window(range.span());
        let query = SeriesQuery::new(keys::MEASUREMENT_BANDWIDTH, range.start, range.stop())
            .filter(
                Predicate::new()
                    .tag(keys::TAG_DEVICE_ID, device_id.to_string())
                    .tag_opt(keys::TAG_INTERFACE, interface),
            )
            .fields([keys::FIELD_RX_RATE, keys::FIELD_TX_RATE])
            .window(window);
        tracing::debug!("Query: {}", query);

        let records = self.series.query(&query).await?;

        let mut interfaces: BTreeMap<String, BTreeMap<DateTime<Utc>, BandwidthPoint>> =
            BTreeMap::new();
        for record in records {
            let Some(name) = record.tag(keys::TAG_INTERFACE) else {
                continue;
            };
            let value = record.value.as_f64().unwrap_or(0.0);
            let point = interfaces
                .entry(name.to_string())
                .or_default()
                .entry(record.time)
                .or_insert(BandwidthPoint {
                    timestamp: record.time,
                    rx_rate: 0.0,
                    tx_rate: 0.0,
                });
            match record.field.as_str() {
                keys::FIELD_RX_RATE => point.rx_rate = value,
                keys::FIELD_TX_RATE => point.tx_rate = value,
                _ => {}
            }
        }

        Ok(BandwidthHistory {
            device_id,
            start: range.start,
            end: range.end,
            window_secs: window.map(|w| w.as_secs()),
            interfaces: interfaces
                .into_iter()
                .map(|(name, points)| (name, points.into_values().collect()))
                .collect(),
        })
    }

    /// Ping series per target with loss events preserved under aggregation.
    pub async fn query_ping(
        &self,
        device_id: i64,
        target: Option<&str>,
        source_interface: Option<&str>,
        request: &ChartRequest,
    ) -> Result<PingHistory> {
        let range = chart_range(request)?;
        self.ensure_device(device_id).await?;

        let predicate = Predicate::new()
            .tag(keys::TAG_DEVICE_ID, device_id.to_string())
            .tag_opt(keys::TAG_TARGET_ADDRESS, target)
            .tag_opt(keys::TAG_SOURCE_INTERFACE, source_interface);

        let raw_query = SeriesQuery::new(keys::MEASUREMENT_PING, range.start, range.stop())
            .filter(predicate.clone())
            .fields([keys::FIELD_LATENCY, keys::FIELD_STATUS]);
        let raw = group_raw(self.series.query(&raw_query).await?);

        let window = select_window(range.span());
        let mut smoothed = match window {
            Some(window) => {
                let query = SeriesQuery::new(keys::MEASUREMENT_PING, range.start, range.stop())
                    .filter(predicate)
                    .fields([keys::FIELD_LATENCY])
                    .greater_than(0.0)
                    .window(Some(window));
                tracing::debug!("Query: {}", query);
                Some(group_smoothed(self.series.query(&query).await?))
            }
            None => None,
        };

        let names = self.cached_target_names(device_id).await;

        let targets = raw
            .into_iter()
            .map(|(id, samples)| {
                let series_smoothed = smoothed
                    .as_mut()
                    .map(|s| s.remove(&id).unwrap_or_default());
                let key = id.key();
                let series = PingSeries {
                    target_name: names.get(&key).cloned(),
                    stats: ping_stats(&samples),
                    points: merge_loss_aware(&samples, series_smoothed),
                    target_address: id.target_address,
                    source_interface: id.source_interface,
                };
                (key, series)
            })
            .collect();

        Ok(PingHistory {
            device_id,
            start: range.start,
            end: range.end,
            window_secs: window.map(|w| w.as_secs()),
            targets,
        })
    }

    /// Sum of every device's bandwidth, per window.
    pub async fn query_total_traffic(&self, request: &ChartRequest) -> Result<TotalTraffic> {
        let range = chart_range(request)?;
        let window = select_traffic_window(range.span());

        let query = SeriesQuery::new(keys::MEASUREMENT_BANDWIDTH, range.start, range.stop())
            .fields([keys::FIELD_RX_RATE, keys::FIELD_TX_RATE])
            .window(Some(window));
        tracing::debug!("Query: {}", query);
        let records = self.series.query(&query).await?;

        let mut totals: BTreeMap<DateTime<Utc>, TrafficPoint> = BTreeMap::new();
        for record in records {
            let Some(value) = record.value.as_f64() else {
                continue;
            };
            let point = totals.entry(record.time).or_insert(TrafficPoint {
                timestamp: record.time,
                rx_rate: 0.0,
                tx_rate: 0.0,
            });
            match record.field.as_str() {
                keys::FIELD_RX_RATE => point.rx_rate += value,
                keys::FIELD_TX_RATE => point.tx_rate += value,
                _ => {}
            }
        }

        Ok(TotalTraffic {
            start: range.start,
            end: range.end,
            window_secs: window.as_secs(),
            points: totals.into_values().collect(),
        })
    }

    /// Mean of one numeric metric over the trailing `window`.
    pub async fn metric_summary(
        &self,
        device_id: i64,
        metric: &str,
        window: ChronoDuration,
    ) -> Result<MetricSummary> {
        if metric.trim().is_empty() {
            return Err(Error::validation("metric", "is required"));
        }
        if window <= ChronoDuration::zero() || window > max_query_span() {
            return Err(Error::validation("window", "must be between 1s and 24h"));
        }
        self.ensure_device(device_id).await?;

        let now = Utc::now();
        let query = SeriesQuery::new(keys::MEASUREMENT_METRICS, now - window, now)
            .filter(Predicate::new().tag(keys::TAG_DEVICE_ID, device_id.to_string()))
            .fields([metric]);
        let values: Vec<f64> = self
            .series
            .query(&query)
            .await?
            .iter()
            .filter_map(|r| r.value.as_f64())
            .collect();

        let mean = if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        };

        Ok(MetricSummary {
            device_id,
            metric: metric.to_string(),
            window_secs: window.num_seconds(),
            mean,
            count: values.len(),
        })
    }

    /// Read-only liveness for each id; nothing is written back.
    pub async fn device_statuses(&self, ids: &[i64]) -> Result<Vec<DeviceStatusEntry>> {
        let now = Utc::now();
        let mut entries = Vec::with_capacity(ids.len());

        for &id in ids {
            let entry = match self.devices.get_by_id(id).await? {
                Some(device) => {
                    let reading = self.liveness.evaluate(&device, now).await;
                    DeviceStatusEntry {
                        device_id: id,
                        name: Some(device.name),
                        status: reading.status,
                        last_seen: reading.last_seen,
                    }
                }
                None => DeviceStatusEntry {
                    device_id: id,
                    name: None,
                    status: DeviceStatus::Unknown,
                    last_seen: None,
                },
            };
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Devices whose recorded status is online.
    pub async fn online_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.get_all_online().await?)
    }

    async fn ensure_device(&self, device_id: i64) -> Result<()> {
        if device_id <= 0 {
            return Err(Error::validation("device_id", "must be a positive integer"));
        }
        if self.devices.get_by_id(device_id).await?.is_none() {
            return Err(Error::NotFound(format!("device {}", device_id)));
        }
        Ok(())
    }

    async fn cached_target_names(&self, device_id: i64) -> BTreeMap<String, String> {
        match self.cache.get_json::<PingSnapshot>(&keys::ping(device_id)).await {
            Ok(Some(snapshot)) => snapshot
                .pings
                .into_iter()
                .filter_map(|p| {
                    let key = p.series_key();
                    p.target_name.map(|name| (key, name))
                })
                .collect(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Query: failed to read ping snapshot for device {}: {}", device_id, e);
                BTreeMap::new()
            }
        }
    }
}

fn chart_range(request: &ChartRequest) -> Result<TimeRange> {
    let range = TimeRange::resolve(
        request.range.as_deref(),
        request.start_time,
        request.end_time,
        ChronoDuration::hours(1),
        Utc::now(),
    )?;
    range.ensure_max_span(max_query_span())?;
    Ok(range)
}
