//! netpulse - network device telemetry pipeline
//!
//! Ingests metric, bandwidth and ping pushes from agents, serves historical
//! queries, enforces retention and tracks device liveness.

mod config;
mod db;
mod error;
mod ingest;
mod query;
mod resolver;
mod scheduler;
mod web;

#[cfg(test)]
mod testutil;

use config::ServerConfig;
use db::{CacheClient, DeviceRepository, DeviceStore, MemoryCache, SeriesStore, TimeSeriesClient};
use ingest::IngestGateway;
use query::QueryEngine;
use resolver::DeviceResolver;
use scheduler::{CleanupEngine, LivenessEvaluator, LivenessMonitor, Scheduler};
use web::{AppState, Server};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netpulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting netpulse on port {}...", cfg.http_port);
    tracing::info!("Using device database at {}", cfg.db_path);
    tracing::info!("Using time-series database at {}", cfg.tsdb_path);

    // Initialize stores
    let device_store = DeviceStore::new(&cfg.db_path)?;
    let series: Arc<dyn TimeSeriesClient> = Arc::new(SeriesStore::new(&cfg.tsdb_path)?);
    let cache: Arc<dyn CacheClient> = Arc::new(MemoryCache::new());
    tracing::info!("Stores initialized successfully");

    // Register configured devices that are not known yet
    for seed in &cfg.seed_devices {
        let (id, created) = device_store.register(&seed.name, &seed.host)?;
        if created {
            tracing::info!("Registered device {} ({}) as {}", seed.name, seed.host, id);
        }
    }
    let devices: Arc<dyn DeviceRepository> = Arc::new(device_store);

    // Build services
    let resolver = DeviceResolver::new(devices.clone(), cache.clone());
    let gateway = IngestGateway::new(series.clone(), cache.clone(), devices.clone(), resolver);
    let query = QueryEngine::new(
        series.clone(),
        cache.clone(),
        devices.clone(),
        LivenessEvaluator::new(cache.clone(), devices.clone(), cfg.status_offline_timeout()),
    );
    let cleanup = CleanupEngine::new(series.clone(), cache.clone());
    let monitor = LivenessMonitor::new(LivenessEvaluator::new(
        cache.clone(),
        devices.clone(),
        cfg.offline_timeout(),
    ));

    // Start background loops
    let root = CancellationToken::new();
    let scheduler = Scheduler::new(&cfg, cleanup.clone(), monitor.clone());
    scheduler.start(&root)?;

    // Serve until Ctrl-C
    let server = Server::new(AppState {
        config: cfg,
        gateway,
        query,
        cleanup,
        monitor,
        series: series.clone(),
        cache: cache.clone(),
    });
    let shutdown = root.clone();
    let served = server
        .start(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await;

    // Drain
    root.cancel();
    scheduler.stop().await;
    series.close().await;
    cache.close().await;
    tracing::info!("netpulse stopped");

    served
}
