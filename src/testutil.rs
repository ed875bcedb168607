//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{
    CacheClient, Collector, Device, DeviceStore, MemoryCache, Point, Predicate, Record,
    SeriesQuery, SeriesStore, StoreError, TimeSeriesClient,
};
use crate::ingest::{IngestGateway, PingSample};
use crate::query::QueryEngine;
use crate::resolver::DeviceResolver;
use crate::scheduler::{CleanupEngine, LivenessEvaluator, LivenessMonitor};

/// Every service wired over in-memory stores.
pub struct TestStack {
    pub series: Arc<dyn TimeSeriesClient>,
    pub cache: Arc<MemoryCache>,
    pub devices: DeviceStore,
    pub gateway: IngestGateway,
    pub query: QueryEngine,
    pub cleanup: CleanupEngine,
    pub monitor: LivenessMonitor,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_series(Arc::new(SeriesStore::in_memory().unwrap()))
    }

    pub fn with_series(series: Arc<dyn TimeSeriesClient>) -> Self {
        let cache = Arc::new(MemoryCache::new());
        let devices = DeviceStore::in_memory().unwrap();
        let repo = Arc::new(devices.clone());

        let resolver = DeviceResolver::new(repo.clone(), cache.clone());
        let gateway = IngestGateway::new(series.clone(), cache.clone(), repo.clone(), resolver);
        let query = QueryEngine::new(
            series.clone(),
            cache.clone(),
            repo.clone(),
            LivenessEvaluator::new(cache.clone(), repo.clone(), Duration::from_secs(600)),
        );
        let cleanup = CleanupEngine::new(series.clone(), cache.clone());
        let monitor = LivenessMonitor::new(LivenessEvaluator::new(
            cache.clone(),
            repo,
            Duration::from_secs(60),
        ));

        Self {
            series,
            cache,
            devices,
            gateway,
            query,
            cleanup,
            monitor,
        }
    }

    pub fn cache_dyn(&self) -> Arc<dyn CacheClient> {
        self.cache.clone()
    }

    /// Register a device, optionally with a push collector.
    pub fn add_device(&self, name: &str, host: &str, with_collector: bool) -> i64 {
        let mut device = Device {
            name: name.to_string(),
            host: host.to_string(),
            ..Default::default()
        };
        let id = self.devices.add_device(&mut device).unwrap();
        if with_collector {
            self.devices
                .add_collector(&mut Collector {
                    device_id: id,
                    ..Default::default()
                })
                .unwrap();
        }
        id
    }
}

pub fn ping(target: &str, source_interface: &str, latency: f64) -> PingSample {
    PingSample {
        target_address: target.to_string(),
        target_name: None,
        source_interface: source_interface.to_string(),
        latency,
        status: None,
    }
}

/// A time-series backend that is always down.
pub struct FailingSeries;

fn unavailable() -> StoreError {
    StoreError::Closed
}

#[async_trait]
impl TimeSeriesClient for FailingSeries {
    async fn write_point(&self, _point: Point) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn query(&self, _query: &SeriesQuery) -> Result<Vec<Record>, StoreError> {
        Err(unavailable())
    }

    async fn delete(
        &self,
        _measurement: &str,
        _start: DateTime<Utc>,
        _stop: DateTime<Utc>,
        _predicate: &Predicate,
    ) -> Result<u64, StoreError> {
        Err(unavailable())
    }

    async fn health(&self) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn close(&self) {}
}
