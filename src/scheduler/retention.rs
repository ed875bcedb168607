//! Retention and scoped cleanup of stored data.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

use super::lifecycle::PeriodicTask;
use crate::db::{keys, CacheClient, Predicate, TimeSeriesClient};
use crate::error::{Error, Result};

/// Deletes time-series rows and cache keys by retention scope.
///
/// Every operation is idempotent. A failure on one measurement is logged
/// and the remaining measurements are still cleaned.
#[derive(Clone)]
pub struct CleanupEngine {
    series: Arc<dyn TimeSeriesClient>,
    cache: Arc<dyn CacheClient>,
}

impl CleanupEngine {
    pub fn new(series: Arc<dyn TimeSeriesClient>, cache: Arc<dyn CacheClient>) -> Self {
        Self { series, cache }
    }

    /// Delete every measurement's rows older than `retention_days`.
    pub async fn cleanup_expired_data(&self, retention_days: i64) -> Result<u64> {
        if retention_days <= 0 {
            return Err(Error::validation("retention_days", "must be positive"));
        }
        // A window reaching past the epoch leaves nothing expired.
        let cutoff = ChronoDuration::try_days(retention_days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .map_or(epoch(), |cutoff| cutoff.max(epoch()));

        let deleted = self
            .delete_measurements(&keys::ALL_MEASUREMENTS, epoch(), cutoff, &Predicate::new())
            .await;
        tracing::info!(
            "Cleanup: removed {} rows older than {} days (cutoff {})",
            deleted,
            retention_days,
            cutoff.to_rfc3339()
        );
        Ok(deleted)
    }

    /// Delete all of a device's data, at any age, plus its cache keys.
    pub async fn cleanup_device_data(&self, device_id: i64) -> Result<u64> {
        validate_device(device_id)?;

        let deleted = self
            .delete_measurements(&keys::ALL_MEASUREMENTS, epoch(), far_future(), &device_predicate(device_id))
            .await;
        self.purge_device_cache(device_id).await;

        tracing::info!("Cleanup: removed {} rows for device {}", deleted, device_id);
        Ok(deleted)
    }

    /// Delete a device's rows older than `cutoff`.
    pub async fn cleanup_device_data_before(&self, device_id: i64, cutoff: DateTime<Utc>) -> Result<u64> {
        validate_device(device_id)?;

        let deleted = self
            .delete_measurements(&keys::ALL_MEASUREMENTS, epoch(), cutoff, &device_predicate(device_id))
            .await;
        tracing::info!(
            "Cleanup: removed {} rows for device {} before {}",
            deleted,
            device_id,
            cutoff.to_rfc3339()
        );
        Ok(deleted)
    }

    /// Delete one interface's bandwidth rows and its cache key.
    pub async fn cleanup_interface_data(&self, device_id: i64, interface: &str) -> Result<u64> {
        validate_device(device_id)?;
        if interface.is_empty() {
            return Err(Error::validation("interface", "is required"));
        }

        let predicate = device_predicate(device_id).tag(keys::TAG_INTERFACE, interface);
        let deleted = self
            .delete_measurements(&[keys::MEASUREMENT_BANDWIDTH], epoch(), far_future(), &predicate)
            .await;
        self.delete_cache_keys(device_id, vec![keys::bandwidth_interface(device_id, interface)])
            .await;

        tracing::info!(
            "Cleanup: removed {} bandwidth rows for device {} interface {}",
            deleted,
            device_id,
            interface
        );
        Ok(deleted)
    }

    /// Delete one ping target's rows and cache keys.
    ///
    /// An empty source interface is left out of the predicate so rows
    /// written without that tag are cleaned too, along with the cache key
    /// of every source interface of the target.
    pub async fn cleanup_ping_target_data(
        &self,
        device_id: i64,
        target_address: &str,
        source_interface: Option<&str>,
    ) -> Result<u64> {
        validate_device(device_id)?;
        if target_address.is_empty() {
            return Err(Error::validation("target_address", "is required"));
        }

        let predicate = device_predicate(device_id)
            .tag(keys::TAG_TARGET_ADDRESS, target_address)
            .tag_opt(keys::TAG_SOURCE_INTERFACE, source_interface);
        let deleted = self
            .delete_measurements(&[keys::MEASUREMENT_PING], epoch(), far_future(), &predicate)
            .await;
        let mut doomed = vec![keys::ping_target(device_id, target_address, source_interface)];
        if source_interface.map_or(true, str::is_empty) {
            let pattern = keys::ping_target_pattern(device_id, target_address);
            match self.cache.keys(&pattern).await {
                Ok(found) => doomed.extend(found),
                Err(e) => tracing::warn!("Cleanup: failed to list cache keys {}: {}", pattern, e),
            }
        }
        self.delete_cache_keys(device_id, doomed).await;

        tracing::info!(
            "Cleanup: removed {} ping rows for device {} target {}",
            deleted,
            device_id,
            target_address
        );
        Ok(deleted)
    }

    async fn delete_measurements(
        &self,
        measurements: &[&str],
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &Predicate,
    ) -> u64 {
        let mut deleted = 0;
        for measurement in measurements {
            match self.series.delete(measurement, start, stop, predicate).await {
                Ok(n) => deleted += n,
                Err(e) => tracing::error!(
                    "Cleanup: failed to delete {} rows matching [{}]: {}",
                    measurement,
                    predicate,
                    e
                ),
            }
        }
        deleted
    }

    async fn purge_device_cache(&self, device_id: i64) {
        let mut doomed = vec![
            keys::latest(device_id),
            keys::status(device_id),
            keys::last_seen(device_id),
            keys::bandwidth(device_id),
            keys::ping(device_id),
        ];
        for pattern in [
            keys::metric_pattern(device_id),
            keys::bandwidth_pattern(device_id),
            keys::ping_pattern(device_id),
        ] {
            match self.cache.keys(&pattern).await {
                Ok(found) => doomed.extend(found),
                Err(e) => tracing::warn!("Cleanup: failed to list cache keys {}: {}", pattern, e),
            }
        }
        self.delete_cache_keys(device_id, doomed).await;
    }

    async fn delete_cache_keys(&self, device_id: i64, doomed: Vec<String>) {
        if let Err(e) = self.cache.delete(&doomed).await {
            tracing::warn!("Cleanup: failed to delete cache keys for device {}: {}", device_id, e);
        }
    }
}

/// The cleanup loop's single iteration: enforce global retention.
pub struct RetentionSweep {
    engine: CleanupEngine,
    retention_days: i64,
}

impl RetentionSweep {
    pub fn new(engine: CleanupEngine, retention_days: i64) -> Self {
        Self {
            engine,
            retention_days,
        }
    }
}

#[async_trait]
impl PeriodicTask for RetentionSweep {
    async fn run_once(&self) {
        if let Err(e) = self.engine.cleanup_expired_data(self.retention_days).await {
            tracing::error!("Cleanup: retention sweep failed: {}", e);
        }
    }
}

fn validate_device(device_id: i64) -> Result<()> {
    if device_id <= 0 {
        return Err(Error::validation("device_id", "must be a positive integer"));
    }
    Ok(())
}

fn device_predicate(device_id: i64) -> Predicate {
    Predicate::new().tag(keys::TAG_DEVICE_ID, device_id.to_string())
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Point, SeriesQuery};
    use crate::testutil::{FailingSeries, TestStack};
    use tokio_test::{assert_err, assert_ok};

    fn ping_point(device_id: i64, at: DateTime<Utc>, target: &str, iface: Option<&str>) -> Point {
        let mut point = Point::new(keys::MEASUREMENT_PING, at)
            .tag(keys::TAG_DEVICE_ID, device_id.to_string())
            .tag(keys::TAG_TARGET_ADDRESS, target)
            .field(keys::FIELD_LATENCY, 5.0)
            .field(keys::FIELD_STATUS, "up");
        if let Some(iface) = iface {
            point = point.tag(keys::TAG_SOURCE_INTERFACE, iface);
        }
        point
    }

    async fn count(stack: &TestStack, measurement: &str, device_id: i64) -> usize {
        let q = SeriesQuery::new(measurement, epoch(), Utc::now() + ChronoDuration::days(1))
            .filter(Predicate::new().tag(keys::TAG_DEVICE_ID, device_id.to_string()));
        stack.series.query(&q).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_device_cleanup_is_isolated() {
        let stack = TestStack::new();
        let at = Utc::now() - ChronoDuration::minutes(1);
        for device in [1, 2] {
            stack.series.write_point(ping_point(device, at, "8.8.8.8", None)).await.unwrap();
        }
        stack.cache.set(&keys::status(1), "online", None).await.unwrap();
        stack.cache.set(&keys::ping_target(1, "8.8.8.8", None), "{}", None).await.unwrap();
        stack.cache.set(&keys::status(2), "online", None).await.unwrap();

        let deleted = stack.cleanup.cleanup_device_data(1).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 1).await, 0);
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 2).await, 2);

        assert!(!stack.cache.exists(&keys::status(1)).await.unwrap());
        assert!(!stack.cache.exists(&keys::ping_target(1, "8.8.8.8", None)).await.unwrap());
        assert!(stack.cache.exists(&keys::status(2)).await.unwrap());

        assert_eq!(stack.cleanup.cleanup_device_data(1).await.unwrap(), 0);
        assert!(stack.cleanup.cleanup_device_data(0).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_expired_cleanup_respects_cutoff() {
        let stack = TestStack::new();
        let old = Utc::now() - ChronoDuration::days(40);
        let fresh = Utc::now() - ChronoDuration::days(1);
        stack.series.write_point(ping_point(1, old, "8.8.8.8", None)).await.unwrap();
        stack.series.write_point(ping_point(1, fresh, "8.8.8.8", None)).await.unwrap();
        stack
            .series
            .write_point(
                Point::new(keys::MEASUREMENT_METRICS, old)
                    .tag(keys::TAG_DEVICE_ID, "1")
                    .field("cpu", 1.0),
            )
            .await
            .unwrap();

        assert_err!(stack.cleanup.cleanup_expired_data(0).await);
        assert_eq!(stack.cleanup.cleanup_expired_data(30).await.unwrap(), 3);
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 1).await, 2);
        assert_eq!(count(&stack, keys::MEASUREMENT_METRICS, 1).await, 0);
    }

    #[tokio::test]
    async fn test_expired_cleanup_with_huge_retention_keeps_everything() {
        let stack = TestStack::new();
        let old = Utc::now() - ChronoDuration::days(400);
        stack.series.write_point(ping_point(1, old, "8.8.8.8", None)).await.unwrap();

        assert_eq!(stack.cleanup.cleanup_expired_data(100_000_000).await.unwrap(), 0);
        assert_eq!(stack.cleanup.cleanup_expired_data(i64::MAX).await.unwrap(), 0);
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 1).await, 2);
    }

    #[tokio::test]
    async fn test_device_cleanup_before_cutoff() {
        let stack = TestStack::new();
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        stack
            .series
            .write_point(ping_point(3, cutoff - ChronoDuration::minutes(5), "1.1.1.1", None))
            .await
            .unwrap();
        stack
            .series
            .write_point(ping_point(3, cutoff + ChronoDuration::minutes(5), "1.1.1.1", None))
            .await
            .unwrap();

        assert_eq!(stack.cleanup.cleanup_device_data_before(3, cutoff).await.unwrap(), 2);
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 3).await, 2);
    }

    #[tokio::test]
    async fn test_interface_cleanup_leaves_siblings() {
        let stack = TestStack::new();
        let at = Utc::now() - ChronoDuration::minutes(1);
        for iface in ["ether1", "ether2"] {
            stack
                .series
                .write_point(
                    Point::new(keys::MEASUREMENT_BANDWIDTH, at)
                        .tag(keys::TAG_DEVICE_ID, "4")
                        .tag(keys::TAG_INTERFACE, iface)
                        .field(keys::FIELD_RX_RATE, 1.0)
                        .field(keys::FIELD_TX_RATE, 2.0),
                )
                .await
                .unwrap();
            stack
                .cache
                .set(&keys::bandwidth_interface(4, iface), "{}", None)
                .await
                .unwrap();
        }

        assert_eq!(stack.cleanup.cleanup_interface_data(4, "ether1").await.unwrap(), 2);
        assert_eq!(count(&stack, keys::MEASUREMENT_BANDWIDTH, 4).await, 2);
        assert!(!stack.cache.exists(&keys::bandwidth_interface(4, "ether1")).await.unwrap());
        assert!(stack.cache.exists(&keys::bandwidth_interface(4, "ether2")).await.unwrap());
        assert_err!(stack.cleanup.cleanup_interface_data(4, "").await);
    }

    #[tokio::test]
    async fn test_ping_target_cleanup_without_interface_matches_legacy_rows() {
        let stack = TestStack::new();
        let at = Utc::now() - ChronoDuration::minutes(1);
        stack.series.write_point(ping_point(5, at, "9.9.9.9", None)).await.unwrap();
        stack
            .series
            .write_point(ping_point(5, at, "9.9.9.9", Some("wan")))
            .await
            .unwrap();
        stack.series.write_point(ping_point(5, at, "1.1.1.1", None)).await.unwrap();

        assert_eq!(
            stack.cleanup.cleanup_ping_target_data(5, "9.9.9.9", Some("wan")).await.unwrap(),
            2
        );
        assert_eq!(
            stack.cleanup.cleanup_ping_target_data(5, "9.9.9.9", Some("")).await.unwrap(),
            2
        );
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 5).await, 2);
    }

    #[tokio::test]
    async fn test_ping_target_cleanup_without_interface_purges_interface_keys() {
        let stack = TestStack::new();
        for key in [
            keys::ping_target(8, "9.9.9.9", None),
            keys::ping_target(8, "9.9.9.9", Some("wan")),
            keys::ping_target(8, "9.9.9.9", Some("lte")),
            keys::ping_target(8, "1.1.1.1", Some("wan")),
        ] {
            stack.cache.set(&key, "{}", None).await.unwrap();
        }

        assert_ok!(stack.cleanup.cleanup_ping_target_data(8, "9.9.9.9", None).await);
        assert!(!stack.cache.exists(&keys::ping_target(8, "9.9.9.9", None)).await.unwrap());
        assert!(!stack.cache.exists(&keys::ping_target(8, "9.9.9.9", Some("wan"))).await.unwrap());
        assert!(!stack.cache.exists(&keys::ping_target(8, "9.9.9.9", Some("lte"))).await.unwrap());
        assert!(stack.cache.exists(&keys::ping_target(8, "1.1.1.1", Some("wan"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_target_cleanup_with_interface_keeps_siblings() {
        let stack = TestStack::new();
        stack.cache.set(&keys::ping_target(8, "9.9.9.9", Some("wan")), "{}", None).await.unwrap();
        stack.cache.set(&keys::ping_target(8, "9.9.9.9", Some("lte")), "{}", None).await.unwrap();

        assert_ok!(stack.cleanup.cleanup_ping_target_data(8, "9.9.9.9", Some("wan")).await);
        assert!(!stack.cache.exists(&keys::ping_target(8, "9.9.9.9", Some("wan"))).await.unwrap());
        assert!(stack.cache.exists(&keys::ping_target(8, "9.9.9.9", Some("lte"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_failure_is_best_effort() {
        let stack = TestStack::with_series(Arc::new(FailingSeries));
        stack.cache.set(&keys::latest(6), "{}", None).await.unwrap();

        assert_ok!(stack.cleanup.cleanup_device_data(6).await);
        assert!(!stack.cache.exists(&keys::latest(6)).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_sweep_runs_cleanup() {
        let stack = TestStack::new();
        let old = Utc::now() - ChronoDuration::days(10);
        stack.series.write_point(ping_point(7, old, "8.8.8.8", None)).await.unwrap();

        RetentionSweep::new(stack.cleanup.clone(), 7).run_once().await;
        assert_eq!(count(&stack, keys::MEASUREMENT_PING, 7).await, 0);
    }
}
