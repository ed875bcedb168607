//! Ingestion gateway.
//!
//! Every push fans out to the time-series store and the hot cache. The two
//! writes are independent best-effort operations: a failed time-series
//! write is logged and the cache mirror still happens, and vice versa.

mod timestamps;
mod types;

pub use timestamps::*;
pub use types::*;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{keys, CacheClient, DeviceRepository, DeviceStatus, Point, TimeSeriesClient};
use crate::error::{Error, Result};
use crate::resolver::DeviceResolver;

/// Latest-value mirrors expire after this long.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);
/// Status and last-seen keys expire after this long.
pub const STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Accepts metric, bandwidth and ping pushes.
#[derive(Clone)]
pub struct IngestGateway {
    series: Arc<dyn TimeSeriesClient>,
    cache: Arc<dyn CacheClient>,
    devices: Arc<dyn DeviceRepository>,
    resolver: DeviceResolver,
}

impl IngestGateway {
    pub fn new(
        series: Arc<dyn TimeSeriesClient>,
        cache: Arc<dyn CacheClient>,
        devices: Arc<dyn DeviceRepository>,
        resolver: DeviceResolver,
    ) -> Self {
        Self {
            series,
            cache,
            devices,
            resolver,
        }
    }

    /// Validate and store one generic metric sample.
    ///
    /// Fails only on validation or device resolution; storage failures are
    /// logged. Returns the resolved device id.
    pub async fn receive_data(&self, payload: MetricPayload) -> Result<i64> {
        let sample = MetricSample::from_payload(payload, Utc::now())?;
        let device_id = self.resolver.resolve_reference(&sample.device_id).await?;

        let mut point = Point::new(keys::MEASUREMENT_METRICS, sample.timestamp);
        for (k, v) in &sample.tags {
            point = point.tag(k.clone(), v.clone());
        }
        point = point.tag(keys::TAG_DEVICE_ID, device_id.to_string());
        for (name, value) in &sample.metrics {
            point = point.field(name.clone(), value.clone());
        }

        if let Err(e) = self.write_and_flush(vec![point]).await {
            tracing::error!("Ingest: time-series write failed for device {}: {}", device_id, e);
        }

        for (name, value) in &sample.metrics {
            if let Err(e) = self
                .cache
                .set_json(&keys::metric(device_id, name), value, Some(SNAPSHOT_TTL))
                .await
            {
                tracing::warn!("Ingest: failed to cache metric {} for device {}: {}", name, device_id, e);
            }
        }
        if let Err(e) = self
            .cache
            .set_json(&keys::latest(device_id), &sample, Some(SNAPSHOT_TTL))
            .await
        {
            tracing::warn!("Ingest: failed to cache latest sample for device {}: {}", device_id, e);
        }

        self.update_device_online_status(device_id).await;
        Ok(device_id)
    }

    /// Apply [`receive_data`](Self::receive_data) to every item, never aborting early.
    pub async fn receive_batch_data(&self, payloads: Vec<MetricPayload>) -> BatchResponse {
        let mut outcome = FanOutOutcome::default();

        for (index, payload) in payloads.into_iter().enumerate() {
            match self.receive_data(payload).await {
                Ok(_) => outcome.success(),
                Err(e) => {
                    tracing::warn!("Ingest: batch item {} rejected: {}", index, e);
                    outcome.failure(format!("item {}: {}", index, e));
                }
            }
        }

        BatchResponse::from_outcome(&outcome)
    }

    /// Write one bandwidth point per interface, then mirror the snapshot.
    pub async fn process_bandwidth_data(
        &self,
        device_id: i64,
        timestamp_ms: i64,
        interfaces: &BTreeMap<String, InterfaceRates>,
    ) -> Result<FanOutOutcome> {
        let timestamp = validate_push(device_id, timestamp_ms)?;
        let mut outcome = FanOutOutcome::default();

        for (name, rates) in interfaces {
            if name.is_empty() || !rates.is_valid() {
                tracing::warn!("Ingest: skipping invalid interface {:?} for device {}", name, device_id);
                outcome.failure(format!("interface {:?}: invalid rates", name));
                continue;
            }
            let point = Point::new(keys::MEASUREMENT_BANDWIDTH, timestamp)
                .tag(keys::TAG_DEVICE_ID, device_id.to_string())
                .tag(keys::TAG_INTERFACE, name.clone())
                .field(keys::FIELD_RX_RATE, rates.rx_rate)
                .field(keys::FIELD_TX_RATE, rates.tx_rate);
            match self.series.write_point(point).await {
                Ok(()) => outcome.success(),
                Err(e) => {
                    tracing::error!(
                        "Ingest: bandwidth write failed for device {} interface {}: {}",
                        device_id,
                        name,
                        e
                    );
                    outcome.failure(format!("interface {}: {}", name, e));
                }
            }
        }

        if let Err(e) = self.series.flush().await {
            tracing::error!("Ingest: bandwidth flush failed for device {}: {}", device_id, e);
        }
        if !outcome.is_complete() {
            tracing::warn!(
                "Ingest: stored {}/{} interfaces for device {}",
                outcome.succeeded,
                outcome.attempted,
                device_id
            );
        }

        let snapshot = BandwidthSample {
            timestamp,
            interfaces: interfaces.clone(),
        };
        if let Err(e) = self
            .cache
            .set_json(&keys::bandwidth(device_id), &snapshot, Some(SNAPSHOT_TTL))
            .await
        {
            tracing::warn!("Ingest: failed to cache bandwidth for device {}: {}", device_id, e);
        }
        for (name, rates) in interfaces {
            if let Err(e) = self
                .cache
                .set_json(&keys::bandwidth_interface(device_id, name), rates, Some(SNAPSHOT_TTL))
                .await
            {
                tracing::warn!(
                    "Ingest: failed to cache bandwidth for device {} interface {}: {}",
                    device_id,
                    name,
                    e
                );
            }
        }

        self.update_device_online_status(device_id).await;
        Ok(outcome)
    }

    /// Write one ping point per target, then mirror the snapshot.
    pub async fn process_ping_data(
        &self,
        device_id: i64,
        timestamp_ms: i64,
        pings: Vec<PingSample>,
    ) -> Result<FanOutOutcome> {
        let timestamp = validate_push(device_id, timestamp_ms)?;
        let mut outcome = FanOutOutcome::default();

        let (pings, rejected): (Vec<PingSample>, Vec<PingSample>) =
            pings.into_iter().partition(PingSample::is_valid);
        for ping in &rejected {
            tracing::warn!(
                "Ingest: skipping invalid ping sample {:?} (latency {}) for device {}",
                ping.target_address,
                ping.latency,
                device_id
            );
            outcome.failure(format!("target {:?}: invalid sample", ping.target_address));
        }
        let pings: Vec<PingSample> = pings.into_iter().map(PingSample::normalized).collect();

        for ping in &pings {
            let status = ping.status.unwrap_or(PingStatus::Down);
            let point = Point::new(keys::MEASUREMENT_PING, timestamp)
                .tag(keys::TAG_DEVICE_ID, device_id.to_string())
                .tag(keys::TAG_TARGET_ADDRESS, ping.target_address.clone())
                .tag(keys::TAG_SOURCE_INTERFACE, ping.source_interface.clone())
                .field(keys::FIELD_LATENCY, ping.latency)
                .field(keys::FIELD_STATUS, status.as_str());
            match self.series.write_point(point).await {
                Ok(()) => outcome.success(),
                Err(e) => {
                    tracing::error!(
                        "Ingest: ping write failed for device {} target {}: {}",
                        device_id,
                        ping.series_key(),
                        e
                    );
                    outcome.failure(format!("target {}: {}", ping.series_key(), e));
                }
            }
        }

        if let Err(e) = self.series.flush().await {
            tracing::error!("Ingest: ping flush failed for device {}: {}", device_id, e);
        }
        if !outcome.is_complete() {
            tracing::warn!(
                "Ingest: stored {}/{} ping targets for device {}",
                outcome.succeeded,
                outcome.attempted,
                device_id
            );
        }

        for ping in &pings {
            let key = keys::ping_target(device_id, &ping.target_address, Some(&ping.source_interface));
            if let Err(e) = self.cache.set_json(&key, ping, Some(SNAPSHOT_TTL)).await {
                tracing::warn!("Ingest: failed to cache ping {} for device {}: {}", key, device_id, e);
            }
        }
        let snapshot = PingSnapshot { timestamp, pings };
        if let Err(e) = self
            .cache
            .set_json(&keys::ping(device_id), &snapshot, Some(SNAPSHOT_TTL))
            .await
        {
            tracing::warn!("Ingest: failed to cache ping snapshot for device {}: {}", device_id, e);
        }

        self.update_device_online_status(device_id).await;
        Ok(outcome)
    }

    /// Mark a device online everywhere its liveness is tracked.
    ///
    /// The four updates are independent; each failure is logged and the
    /// rest still run.
    pub async fn update_device_online_status(&self, device_id: i64) {
        let now = Utc::now();

        if let Err(e) = self
            .cache
            .set(&keys::status(device_id), DeviceStatus::Online.as_str(), Some(STATUS_TTL))
            .await
        {
            tracing::warn!("Ingest: failed to cache status for device {}: {}", device_id, e);
        }
        if let Err(e) = self
            .cache
            .set(&keys::last_seen(device_id), &now.to_rfc3339(), Some(STATUS_TTL))
            .await
        {
            tracing::warn!("Ingest: failed to cache last-seen for device {}: {}", device_id, e);
        }
        if let Err(e) = self.devices.update_status(device_id, DeviceStatus::Online, now).await {
            tracing::warn!("Ingest: failed to persist status for device {}: {}", device_id, e);
        }
        match self.devices.record_push(device_id, now).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Ingest: device {} has no collector record", device_id),
            Err(e) => tracing::warn!("Ingest: failed to record push for device {}: {}", device_id, e),
        }
    }

    async fn write_and_flush(&self, points: Vec<Point>) -> Result<()> {
        for point in points {
            self.series.write_point(point).await?;
        }
        self.series.flush().await?;
        Ok(())
    }
}

fn validate_push(device_id: i64, timestamp_ms: i64) -> Result<DateTime<Utc>> {
    if device_id <= 0 {
        return Err(Error::validation("device_id", "must be a positive integer"));
    }
    from_millis(timestamp_ms).ok_or_else(|| Error::validation("timestamp", "out of range"))
}
