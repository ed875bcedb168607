//! SQLite device registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::Arc;

use super::models::*;
use super::{format_db_time, parse_db_time, StoreError};

/// Relational device lookups consumed by the pipeline.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<Device>, StoreError>;

    async fn get_by_host(&self, addr: &str) -> Result<Option<Device>, StoreError>;

    /// Persist a status; `online` also stamps `last_seen` with `at`.
    async fn update_status(
        &self,
        id: i64,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list(
        &self,
        offset: i64,
        limit: i64,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, StoreError>;

    async fn get_all_online(&self) -> Result<Vec<Device>, StoreError>;

    async fn get_collector_by_device(&self, device_id: i64) -> Result<Option<Collector>, StoreError>;

    /// Bump a collector's push counter. Returns false when the device has none.
    async fn record_push(&self, device_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;
}

const DEVICE_COLUMNS: &str = "id, name, host, status, last_seen";

/// Thread-safe device store.
#[derive(Clone)]
pub struct DeviceStore {
    conn: Arc<Mutex<Connection>>,
}

impl DeviceStore {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute_batch(include_str!("../../migrations/devices_000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/devices_000002_collectors.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    /// Register a device and return its ID.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (name, host, status, last_seen) VALUES (?1, ?2, ?3, ?4)",
            params![
                device.name,
                device.host,
                device.status.as_str(),
                device.last_seen.map(format_db_time),
            ],
        )?;
        let id = conn.last_insert_rowid();
        device.id = id;
        Ok(id)
    }

    /// Attach a push collector to a device.
    pub fn add_collector(&self, collector: &mut Collector) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collectors (device_id, push_count, last_push_at) VALUES (?1, ?2, ?3)",
            params![
                collector.device_id,
                collector.push_count,
                collector.last_push_at.map(format_db_time),
            ],
        )?;
        let id = conn.last_insert_rowid();
        collector.id = id;
        Ok(id)
    }

    /// Register a device with a push collector unless its host is known.
    ///
    /// Returns the device ID and whether it was newly created.
    pub fn register(&self, name: &str, host: &str) -> Result<(i64, bool), StoreError> {
        if let Some(existing) = self.find_device("host = ?1", &host)? {
            return Ok((existing.id, false));
        }
        let mut device = Device {
            name: name.to_string(),
            host: host.to_string(),
            ..Default::default()
        };
        let id = self.add_device(&mut device)?;
        self.add_collector(&mut Collector {
            device_id: id,
            ..Default::default()
        })?;
        Ok((id, true))
    }

    fn find_device(&self, clause: &str, arg: &dyn rusqlite::ToSql) -> Result<Option<Device>, StoreError> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE {}", DEVICE_COLUMNS, clause),
                params![arg],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn select_devices(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let devices = stmt
            .query_map(args, device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }
}

#[async_trait]
impl DeviceRepository for DeviceStore {
    async fn get_by_id(&self, id: i64) -> Result<Option<Device>, StoreError> {
        self.find_device("id = ?1", &id)
    }

    async fn get_by_host(&self, addr: &str) -> Result<Option<Device>, StoreError> {
        self.find_device("host = ?1", &addr)
    }

    async fn update_status(
        &self,
        id: i64,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        if status == DeviceStatus::Online {
            conn.execute(
                "UPDATE devices SET status = ?1, last_seen = ?2 WHERE id = ?3",
                params![status.as_str(), format_db_time(at), id],
            )?;
        } else {
            conn.execute(
                "UPDATE devices SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        Ok(())
    }

    async fn list(
        &self,
        offset: i64,
        limit: i64,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, StoreError> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let search = filter.search.as_ref().map(|s| format!("%{}%", s));
        // SQLite treats a negative LIMIT as "no limit"
        let limit = if limit <= 0 { -1 } else { limit };

        self.select_devices(
            &format!(
                "SELECT {} FROM devices
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR name LIKE ?2 OR host LIKE ?2)
                 ORDER BY id ASC LIMIT ?3 OFFSET ?4",
                DEVICE_COLUMNS
            ),
            &[&status, &search, &limit, &offset.max(0)],
        )
    }

    async fn get_all_online(&self) -> Result<Vec<Device>, StoreError> {
        self.select_devices(
            &format!(
                "SELECT {} FROM devices WHERE status = 'online' ORDER BY id ASC",
                DEVICE_COLUMNS
            ),
            &[],
        )
    }

    async fn get_collector_by_device(&self, device_id: i64) -> Result<Option<Collector>, StoreError> {
        let conn = self.conn.lock();
        let collector = conn
            .query_row(
                "SELECT id, device_id, push_count, last_push_at FROM collectors WHERE device_id = ?1",
                params![device_id],
                |row| {
                    let last_push: Option<String> = row.get(3)?;
                    Ok(Collector {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        push_count: row.get(2)?,
                        last_push_at: last_push.as_deref().and_then(parse_db_time),
                    })
                },
            )
            .optional()?;
        Ok(collector)
    }

    async fn record_push(&self, device_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE collectors SET push_count = push_count + 1, last_push_at = ?1 WHERE device_id = ?2",
            params![format_db_time(at), device_id],
        )?;
        Ok(updated > 0)
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    let status: String = row.get(3)?;
    let last_seen: Option<String> = row.get(4)?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        status: status.parse().unwrap_or_default(),
        last_seen: last_seen.as_deref().and_then(parse_db_time),
    })
}
