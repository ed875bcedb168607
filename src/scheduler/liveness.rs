//! Device liveness: online/offline/unknown from the freshest signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::lifecycle::PeriodicTask;
use crate::db::{keys, parse_db_time, CacheClient, Device, DeviceFilter, DeviceRepository, DeviceStatus};
use crate::error::{Error, Result};
use crate::ingest::STATUS_TTL;

/// Where a liveness timestamp came from, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Cache,
    Collector,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LivenessReading {
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub source: Option<SignalSource>,
}

/// Online iff the signal is younger than `timeout`.
pub fn status_for(last_seen: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> DeviceStatus {
    let age = (now - last_seen).to_std().unwrap_or(Duration::ZERO);
    if age < timeout {
        DeviceStatus::Online
    } else {
        DeviceStatus::Offline
    }
}

/// Read path: computes a device's status without writing anything.
#[derive(Clone)]
pub struct LivenessEvaluator {
    cache: Arc<dyn CacheClient>,
    devices: Arc<dyn DeviceRepository>,
    offline_timeout: Duration,
}

impl LivenessEvaluator {
    pub fn new(
        cache: Arc<dyn CacheClient>,
        devices: Arc<dyn DeviceRepository>,
        offline_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            devices,
            offline_timeout,
        }
    }

    pub fn offline_timeout(&self) -> Duration {
        self.offline_timeout
    }

    /// First available signal: cache last-seen, collector last push, then
    /// the device record. No signal at all means `unknown`.
    pub async fn evaluate(&self, device: &Device, now: DateTime<Utc>) -> LivenessReading {
        match self.last_signal(device).await {
            Some((last_seen, source)) => LivenessReading {
                status: status_for(last_seen, now, self.offline_timeout),
                last_seen: Some(last_seen),
                source: Some(source),
            },
            None => LivenessReading {
                status: DeviceStatus::Unknown,
                last_seen: None,
                source: None,
            },
        }
    }

    async fn last_signal(&self, device: &Device) -> Option<(DateTime<Utc>, SignalSource)> {
        match self.cache.get(&keys::last_seen(device.id)).await {
            Ok(Some(raw)) => match parse_db_time(&raw) {
                Some(ts) => return Some((ts, SignalSource::Cache)),
                None => tracing::warn!("Liveness: unparseable cached last-seen {:?} for device {}", raw, device.id),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Liveness: cache read failed for device {}: {}", device.id, e),
        }

        match self.devices.get_collector_by_device(device.id).await {
            Ok(Some(collector)) => {
                if let Some(ts) = collector.last_push_at {
                    return Some((ts, SignalSource::Collector));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Liveness: collector lookup failed for device {}: {}", device.id, e),
        }

        device.last_seen.map(|ts| (ts, SignalSource::Device))
    }
}

/// Totals from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub changed: usize,
}

/// Write path: evaluates devices and persists status changes.
#[derive(Clone)]
pub struct LivenessMonitor {
    evaluator: LivenessEvaluator,
    cache: Arc<dyn CacheClient>,
    devices: Arc<dyn DeviceRepository>,
}

impl LivenessMonitor {
    pub fn new(evaluator: LivenessEvaluator) -> Self {
        Self {
            cache: evaluator.cache.clone(),
            devices: evaluator.devices.clone(),
            evaluator,
        }
    }

    pub fn offline_timeout(&self) -> Duration {
        self.evaluator.offline_timeout()
    }

    /// Evaluate one device now and persist its status if it changed.
    pub async fn check_single_device(&self, device_id: i64) -> Result<LivenessReading> {
        let device = self
            .devices
            .get_by_id(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;
        let reading = self.evaluator.evaluate(&device, Utc::now()).await;
        self.apply(&device, &reading).await?;
        Ok(reading)
    }

    /// Evaluate every device. Per-device write failures are logged.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let devices = self.devices.list(0, 0, &DeviceFilter::default()).await?;
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        for device in &devices {
            let reading = self.evaluator.evaluate(device, now).await;
            match reading.status {
                DeviceStatus::Online => summary.online += 1,
                DeviceStatus::Offline => summary.offline += 1,
                DeviceStatus::Unknown => summary.unknown += 1,
            }
            match self.apply(device, &reading).await {
                Ok(true) => summary.changed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    "Liveness: failed to persist status for {} ({}): {}",
                    device.name,
                    device.id,
                    e
                ),
            }
        }

        tracing::info!(
            "Liveness: sweep complete, {} online, {} offline, {} unknown ({} changed)",
            summary.online,
            summary.offline,
            summary.unknown,
            summary.changed
        );
        Ok(summary)
    }

    /// Persist a reading when it differs from the recorded status.
    async fn apply(&self, device: &Device, reading: &LivenessReading) -> Result<bool> {
        if reading.status == device.status {
            return Ok(false);
        }

        match (device.status, reading.status) {
            (DeviceStatus::Online, DeviceStatus::Offline) => tracing::info!(
                "Liveness: device {} ({}) went offline, last seen {:?}",
                device.name,
                device.id,
                reading.last_seen
            ),
            (DeviceStatus::Offline, DeviceStatus::Online) => {
                tracing::info!("Liveness: device {} ({}) came back online", device.name, device.id)
            }
            (from, to) => tracing::debug!(
                "Liveness: device {} ({}) {} -> {}",
                device.name,
                device.id,
                from,
                to
            ),
        }

        if let Err(e) = self
            .cache
            .set(&keys::status(device.id), reading.status.as_str(), Some(STATUS_TTL))
            .await
        {
            tracing::warn!("Liveness: failed to cache status for device {}: {}", device.id, e);
        }
        let at = reading.last_seen.unwrap_or_else(Utc::now);
        self.devices.update_status(device.id, reading.status, at).await?;
        Ok(true)
    }
}

#[async_trait]
impl PeriodicTask for LivenessMonitor {
    async fn run_once(&self) {
        if let Err(e) = self.sweep().await {
            tracing::error!("Liveness: sweep failed: {}", e);
        }
    }
}
