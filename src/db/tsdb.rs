//! Time-series storage: client trait, query model and a SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::models::MetricValue;
use super::predicate::Predicate;
use super::StoreError;

/// Pending points are committed once this many have been buffered.
const DEFAULT_BATCH_SIZE: usize = 500;

/// A single write: one timestamp, one tag set, any number of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, MetricValue>,
    pub time: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// One `(timestamp, field)` row returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: DateTime<Utc>,
    pub measurement: String,
    pub field: String,
    pub value: MetricValue,
    pub tags: BTreeMap<String, String>,
}

impl Record {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// A range query over one measurement.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub measurement: String,
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub stop: DateTime<Utc>,
    pub predicate: Predicate,
    /// Restrict to these fields; empty means all.
    pub fields: Vec<String>,
    /// Keep only numeric values strictly greater than this.
    pub greater_than: Option<f64>,
    /// Average numeric values over epoch-aligned windows of this width.
    pub window: Option<Duration>,
}

impl SeriesQuery {
    pub fn new(measurement: impl Into<String>, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            start,
            stop,
            predicate: Predicate::new(),
            fields: Vec::new(),
            greater_than: None,
            window: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn greater_than(mut self, threshold: f64) -> Self {
        self.greater_than = Some(threshold);
        self
    }

    pub fn window(mut self, window: Option<Duration>) -> Self {
        self.window = window.filter(|w| !w.is_zero());
        self
    }
}

impl fmt::Display for SeriesQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range(start: {}, stop: {}) |> filter(_measurement=\"{}\"",
            self.start.to_rfc3339(),
            self.stop.to_rfc3339(),
            self.measurement
        )?;
        if !self.predicate.is_empty() {
            write!(f, " AND {}", self.predicate)?;
        }
        f.write_str(")")?;
        if !self.fields.is_empty() {
            write!(f, " |> filter(_field in [{}])", self.fields.join(", "))?;
        }
        if let Some(threshold) = self.greater_than {
            write!(f, " |> filter(_value > {})", threshold)?;
        }
        if let Some(window) = self.window {
            write!(f, " |> aggregateWindow(every: {}s, fn: mean)", window.as_secs_f64())?;
        }
        Ok(())
    }
}

/// Client for the append-mostly time-series backend.
#[async_trait]
pub trait TimeSeriesClient: Send + Sync {
    /// Queue a point. Same measurement, tags, field and time overwrite.
    async fn write_point(&self, point: Point) -> Result<(), StoreError>;

    /// Commit everything queued so far.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Run a range query. Records come back sorted by time ascending.
    async fn query(&self, query: &SeriesQuery) -> Result<Vec<Record>, StoreError>;

    /// Delete rows of `measurement` in `[start, stop)` matching `predicate`.
    /// Returns the number of rows removed.
    async fn delete(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &Predicate,
    ) -> Result<u64, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    async fn close(&self);
}

/// SQLite-backed time-series store.
#[derive(Clone)]
pub struct SeriesStore {
    conn: Arc<Mutex<Connection>>,
    pending: Arc<Mutex<Vec<Point>>>,
    closed: Arc<AtomicBool>,
    batch_size: usize,
}

impl SeriesStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a private in-memory store.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(include_str!("../../migrations/series_000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("series migration 1 failed: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn enqueue(&self, point: Point) -> Result<(), StoreError> {
        self.ensure_open()?;
        let should_flush = {
            let mut pending = self.pending.lock();
            pending.push(point);
            pending.len() >= self.batch_size
        };
        if should_flush {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Commit queued points in one transaction.
    fn flush_pending(&self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO points (measurement, tags, field, time, kind, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(measurement, tags, field, time) DO UPDATE SET
                 kind=excluded.kind, value=excluded.value",
            )?;

            for point in &batch {
                let tags = serde_json::to_string(&point.tags)?;
                let time = point.time.timestamp_micros();
                for (field, value) in &point.fields {
                    stmt.execute(params![
                        point.measurement,
                        tags,
                        field,
                        time,
                        value.kind(),
                        to_sql_value(value),
                    ])?;
                }
            }
        }
        tx.commit()?;

        tracing::debug!("SeriesStore: flushed {} points", batch.len());
        Ok(())
    }

    fn run_query(&self, query: &SeriesQuery) -> Result<Vec<Record>, StoreError> {
        self.ensure_open()?;
        query.predicate.validate()?;
        self.flush_pending()?;

        let mut sql = String::from(
            "SELECT tags, field, time, kind, value FROM points
             WHERE measurement = ? AND time >= ? AND time < ?",
        );
        let mut args: Vec<Value> = vec![
            Value::Text(query.measurement.clone()),
            Value::Integer(query.start.timestamp_micros()),
            Value::Integer(query.stop.timestamp_micros()),
        ];
        push_tag_clauses(&mut sql, &mut args, &query.predicate);
        if !query.fields.is_empty() {
            let marks = vec!["?"; query.fields.len()].join(", ");
            sql.push_str(&format!(" AND field IN ({})", marks));
            args.extend(query.fields.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY time ASC, tags ASC, field ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let tags_json: String = row.get(0)?;
            let field: String = row.get(1)?;
            let micros: i64 = row.get(2)?;
            let kind: String = row.get(3)?;
            let Some(value) = decode_value(&kind, row.get_ref(4)?) else {
                continue;
            };
            let Some(time) = DateTime::from_timestamp_micros(micros) else {
                continue;
            };
            if let Some(threshold) = query.greater_than {
                match value.as_f64() {
                    Some(v) if v > threshold => {}
                    _ => continue,
                }
            }
            records.push(Record {
                time,
                measurement: query.measurement.clone(),
                field,
                value,
                tags: serde_json::from_str(&tags_json)?,
            });
        }

        Ok(match query.window {
            Some(window) => aggregate_mean(records, window),
            None => records,
        })
    }

    fn run_delete(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &Predicate,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        predicate.validate()?;
        self.flush_pending()?;

        let mut sql =
            String::from("DELETE FROM points WHERE measurement = ? AND time >= ? AND time < ?");
        let mut args: Vec<Value> = vec![
            Value::Text(measurement.to_string()),
            Value::Integer(start.timestamp_micros()),
            Value::Integer(stop.timestamp_micros()),
        ];
        push_tag_clauses(&mut sql, &mut args, predicate);

        let conn = self.conn.lock();
        let removed = conn.execute(&sql, params_from_iter(args))?;
        Ok(removed as u64)
    }
}

#[async_trait]
impl TimeSeriesClient for SeriesStore {
    async fn write_point(&self, point: Point) -> Result<(), StoreError> {
        self.enqueue(point)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.flush_pending()
    }

    async fn query(&self, query: &SeriesQuery) -> Result<Vec<Record>, StoreError> {
        self.run_query(query)
    }

    async fn delete(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &Predicate,
    ) -> Result<u64, StoreError> {
        self.run_delete(measurement, start, stop, predicate)
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.flush_pending() {
            tracing::error!("SeriesStore: failed to flush on close: {}", e);
        }
        self.closed.store(true, Ordering::Release);
    }
}

/// Append `json_extract` equality clauses; keys were validated as identifiers.
fn push_tag_clauses(sql: &mut String, args: &mut Vec<Value>, predicate: &Predicate) {
    for (key, value) in predicate.constraints() {
        sql.push_str(" AND json_extract(tags, ?) = ?");
        args.push(Value::Text(format!("$.{}", key)));
        args.push(Value::Text(value.clone()));
    }
}

fn to_sql_value(value: &MetricValue) -> Value {
    match value {
        MetricValue::Float(f) => Value::Real(*f),
        MetricValue::Int(i) => Value::Integer(*i),
        MetricValue::Bool(b) => Value::Integer(i64::from(*b)),
        MetricValue::Str(s) => Value::Text(s.clone()),
    }
}

fn decode_value(kind: &str, raw: ValueRef<'_>) -> Option<MetricValue> {
    match (kind, raw) {
        ("float", ValueRef::Real(f)) => Some(MetricValue::Float(f)),
        ("float", ValueRef::Integer(i)) => Some(MetricValue::Float(i as f64)),
        ("int", ValueRef::Integer(i)) => Some(MetricValue::Int(i)),
        ("bool", ValueRef::Integer(i)) => Some(MetricValue::Bool(i != 0)),
        ("str", ValueRef::Text(t)) => Some(MetricValue::Str(String::from_utf8_lossy(t).into_owned())),
        _ => None,
    }
}

/// Start of the epoch-aligned window containing `micros`.
pub fn window_start_micros(micros: i64, window: Duration) -> i64 {
    let width = (window.as_micros() as i64).max(1);
    micros - micros.rem_euclid(width)
}

/// Average numeric records per `(window, series, field)`.
///
/// Buckets are stamped with their start time; windows without numeric
/// samples produce nothing.
fn aggregate_mean(records: Vec<Record>, window: Duration) -> Vec<Record> {
    let mut buckets: BTreeMap<(i64, BTreeMap<String, String>, String), (f64, u64)> =
        BTreeMap::new();
    let measurement = records
        .first()
        .map(|r| r.measurement.clone())
        .unwrap_or_default();

    for record in records {
        let Some(value) = record.value.as_f64() else {
            continue;
        };
        let start = window_start_micros(record.time.timestamp_micros(), window);
        let entry = buckets
            .entry((start, record.tags, record.field))
            .or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .filter_map(|((start, tags, field), (sum, count))| {
            Some(Record {
                time: DateTime::from_timestamp_micros(start)?,
                measurement: measurement.clone(),
                field,
                value: MetricValue::Float(sum / count as f64),
                tags,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn ping_point(device: &str, at: DateTime<Utc>, latency: f64) -> Point {
        Point::new("ping", at)
            .tag("device_id", device)
            .tag("target_address", "8.8.8.8")
            .field("latency", latency)
            .field("status", if latency > 0.0 { "up" } else { "down" })
    }

    #[tokio::test]
    async fn test_write_query_roundtrip_on_disk() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SeriesStore::new(tmp.path()).unwrap();

        store.write_point(ping_point("1", base(), 12.5)).await.unwrap();
        store.flush().await.unwrap();

        let q = SeriesQuery::new("ping", base(), base() + ChronoDuration::seconds(1));
        let records = store.query(&q).await.unwrap();
        assert_eq!(records.len(), 2);
        let latency = records.iter().find(|r| r.field == "latency").unwrap();
        assert_eq!(latency.value, MetricValue::Float(12.5));
        assert_eq!(latency.tag("device_id"), Some("1"));
        assert_eq!(latency.time, base());
        let status = records.iter().find(|r| r.field == "status").unwrap();
        assert_eq!(status.value.as_str(), Some("up"));
    }

    #[tokio::test]
    async fn test_duplicate_write_overwrites() {
        let store = SeriesStore::in_memory().unwrap();
        store.write_point(ping_point("1", base(), 10.0)).await.unwrap();
        store.write_point(ping_point("1", base(), 30.0)).await.unwrap();

        let q = SeriesQuery::new("ping", base(), base() + ChronoDuration::seconds(1))
            .fields(["latency"]);
        let records = store.query(&q).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, MetricValue::Float(30.0));
    }

    #[tokio::test]
    async fn test_predicate_and_value_filter() {
        let store = SeriesStore::in_memory().unwrap();
        store.write_point(ping_point("1", base(), 10.0)).await.unwrap();
        store
            .write_point(ping_point("1", base() + ChronoDuration::seconds(1), 0.0))
            .await
            .unwrap();
        store
            .write_point(ping_point("2", base() + ChronoDuration::seconds(2), 50.0))
            .await
            .unwrap();

        let q = SeriesQuery::new("ping", base(), base() + ChronoDuration::minutes(1))
            .filter(Predicate::new().tag("device_id", "1"))
            .fields(["latency"])
            .greater_than(0.0);
        let records = store.query(&q).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, MetricValue::Float(10.0));
    }

    #[tokio::test]
    async fn test_quoted_tag_value_cannot_widen_match() {
        let store = SeriesStore::in_memory().unwrap();
        store.write_point(ping_point("1", base(), 10.0)).await.unwrap();

        let q = SeriesQuery::new("ping", base(), base() + ChronoDuration::minutes(1))
            .filter(Predicate::new().tag("device_id", r#"2" OR 1=1 OR "a"="a"#));
        assert!(store.query(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_window_mean_aligns_to_epoch() {
        let store = SeriesStore::in_memory().unwrap();
        let t0 = base() + ChronoDuration::milliseconds(100);
        store.write_point(ping_point("1", t0, 10.0)).await.unwrap();
        store
            .write_point(ping_point("1", t0 + ChronoDuration::milliseconds(900), 20.0))
            .await
            .unwrap();
        store
            .write_point(ping_point("1", t0 + ChronoDuration::seconds(2), 40.0))
            .await
            .unwrap();

        let q = SeriesQuery::new("ping", base(), base() + ChronoDuration::minutes(1))
            .fields(["latency", "status"])
            .window(Some(Duration::from_secs(2)));
        let records = store.query(&q).await.unwrap();

        // status strings are not averaged
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, base());
        assert_eq!(records[0].value, MetricValue::Float(15.0));
        assert_eq!(records[1].time, base() + ChronoDuration::seconds(2));
        assert_eq!(records[1].value, MetricValue::Float(40.0));
    }

    #[tokio::test]
    async fn test_delete_scoped_by_predicate_and_range() {
        let store = SeriesStore::in_memory().unwrap();
        store.write_point(ping_point("1", base(), 10.0)).await.unwrap();
        store.write_point(ping_point("2", base(), 10.0)).await.unwrap();
        store
            .write_point(ping_point("1", base() + ChronoDuration::hours(2), 10.0))
            .await
            .unwrap();

        let removed = store
            .delete(
                "ping",
                base() - ChronoDuration::hours(1),
                base() + ChronoDuration::hours(1),
                &Predicate::new().tag("device_id", "1"),
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let q = SeriesQuery::new("ping", base() - ChronoDuration::days(1), base() + ChronoDuration::days(1))
            .fields(["latency"]);
        let left = store.query(&q).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|r| r.tag("device_id") == Some("2")));
        assert!(left
            .iter()
            .any(|r| r.tag("device_id") == Some("1") && r.time == base() + ChronoDuration::hours(2)));
    }

    #[tokio::test]
    async fn test_batch_size_autoflush_and_close() {
        let store = SeriesStore::in_memory().unwrap();
        for i in 0..(DEFAULT_BATCH_SIZE as i64 + 5) {
            store
                .write_point(ping_point("1", base() + ChronoDuration::seconds(i), 1.0))
                .await
                .unwrap();
        }
        assert_eq!(store.pending.lock().len(), 5);
        assert_ok!(store.health().await);

        store.close().await;
        assert!(store.pending.lock().is_empty());
        assert_err!(store.health().await);
        assert_err!(store.write_point(ping_point("1", base(), 1.0)).await);
    }

    #[test]
    fn test_query_display() {
        let q = SeriesQuery::new("bandwidth", base(), base() + ChronoDuration::hours(1))
            .filter(Predicate::new().tag("device_id", "3"))
            .fields(["rx_rate", "tx_rate"])
            .window(Some(Duration::from_secs(2)));
        let text = q.to_string();
        assert!(text.contains("_measurement=\"bandwidth\" AND device_id=\"3\""));
        assert!(text.contains("aggregateWindow(every: 2s"));
    }

    #[test]
    fn test_window_start_micros() {
        assert_eq!(window_start_micros(2_500_000, Duration::from_secs(2)), 2_000_000);
        assert_eq!(window_start_micros(-1, Duration::from_secs(2)), -2_000_000);
    }
}
