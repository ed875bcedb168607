//! Configuration module for netpulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// A device registered at startup when its host is not known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDevice {
    pub name: String,
    pub host: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite device database (default: "netpulse.db")
    pub db_path: String,
    /// Path to the SQLite time-series database (default: "netpulse-series.db")
    pub tsdb_path: String,
    /// Global retention used by the cleanup loop, in days (default: 30)
    pub retention_days: i64,
    /// Cleanup loop period in seconds (default: 86400)
    pub cleanup_interval_secs: u64,
    /// Liveness sweep period in seconds (default: 30)
    pub liveness_interval_secs: u64,
    /// Offline timeout of the periodic liveness checker (default: 60)
    pub offline_timeout_secs: u64,
    /// Offline timeout of read-only status queries (default: 600)
    pub status_offline_timeout_secs: u64,
    /// Step used to back-fill missing timestamps in pushed batches (default: 1000)
    pub collector_interval_ms: i64,
    /// Devices to register at startup (default: none)
    pub seed_devices: Vec<SeedDevice>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "netpulse.db".to_string(),
            tsdb_path: "netpulse-series.db".to_string(),
            retention_days: 30,
            cleanup_interval_secs: 24 * 60 * 60,
            liveness_interval_secs: 30,
            offline_timeout_secs: 60,
            status_offline_timeout_secs: 10 * 60,
            collector_interval_ms: 1000,
            seed_devices: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPULSE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETPULSE_DB_PATH`: device database path (default: "netpulse.db")
    /// - `NETPULSE_TSDB_PATH`: time-series database path (default: "netpulse-series.db")
    /// - `NETPULSE_RETENTION_DAYS`: global retention in days (default: 30)
    /// - `NETPULSE_CLEANUP_INTERVAL_SECS`: cleanup period (default: 86400)
    /// - `NETPULSE_LIVENESS_INTERVAL_SECS`: liveness sweep period (default: 30)
    /// - `NETPULSE_OFFLINE_TIMEOUT_SECS`: checker offline timeout (default: 60)
    /// - `NETPULSE_STATUS_OFFLINE_TIMEOUT_SECS`: status query timeout (default: 600)
    /// - `NETPULSE_COLLECTOR_INTERVAL_MS`: back-fill step (default: 1000)
    /// - `NETPULSE_DEVICES`: `name=host` pairs separated by commas (default: none)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        override_from_env("NETPULSE_HTTP_PORT", &mut cfg.http_port);
        override_from_env("NETPULSE_RETENTION_DAYS", &mut cfg.retention_days);
        override_from_env("NETPULSE_CLEANUP_INTERVAL_SECS", &mut cfg.cleanup_interval_secs);
        override_from_env("NETPULSE_LIVENESS_INTERVAL_SECS", &mut cfg.liveness_interval_secs);
        override_from_env("NETPULSE_OFFLINE_TIMEOUT_SECS", &mut cfg.offline_timeout_secs);
        override_from_env(
            "NETPULSE_STATUS_OFFLINE_TIMEOUT_SECS",
            &mut cfg.status_offline_timeout_secs,
        );
        override_from_env("NETPULSE_COLLECTOR_INTERVAL_MS", &mut cfg.collector_interval_ms);

        if let Ok(db_path) = env::var("NETPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(tsdb_path) = env::var("NETPULSE_TSDB_PATH") {
            cfg.tsdb_path = tsdb_path;
        }

        if let Ok(devices) = env::var("NETPULSE_DEVICES") {
            cfg.seed_devices = parse_seed_devices(&devices);
        }

        cfg
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }

    pub fn status_offline_timeout(&self) -> Duration {
        Duration::from_secs(self.status_offline_timeout_secs)
    }
}

/// Replace `slot` with the parsed value of `key`; unparseable values keep the default.
fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}

/// Parse `name=host,name=host`. Malformed entries are skipped.
fn parse_seed_devices(raw: &str) -> Vec<SeedDevice> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((name, host)) if !name.trim().is_empty() && !host.trim().is_empty() => Some(SeedDevice {
                name: name.trim().to_string(),
                host: host.trim().to_string(),
            }),
            _ => {
                tracing::warn!("Ignoring malformed device entry {:?}", entry);
                None
            }
        })
        .collect()
}
