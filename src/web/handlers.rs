//! HTTP request handlers.

use super::AppState;
use crate::db::{Device, StoreError};
use crate::error::{Error, Result};
use crate::ingest::{
    backfill_timestamps, BatchResponse, FanOutOutcome, InterfaceRates, MetricPayload, PingSample,
};
use crate::query::{
    BandwidthHistory, ChartRequest, DeviceStatusEntry, HistoryRequest, HistoryResponse,
    MetricSummary, PingHistory, TotalTraffic,
};
use crate::scheduler::LivenessReading;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyRunning(_) => StatusCode::CONFLICT,
            Error::Storage(e) => {
                tracing::error!("Web: storage error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Push
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub success: bool,
    pub device_id: i64,
}

pub async fn handle_push_metrics(
    State(state): State<AppState>,
    Json(payload): Json<MetricPayload>,
) -> Result<Json<AcceptedResponse>> {
    let device_id = state.gateway.receive_data(payload).await?;
    Ok(Json(AcceptedResponse {
        success: true,
        device_id,
    }))
}

pub async fn handle_push_metrics_batch(
    State(state): State<AppState>,
    Json(mut payloads): Json<Vec<MetricPayload>>,
) -> Json<BatchResponse> {
    let explicit: Vec<_> = payloads.iter().map(|p| p.timestamp).collect();
    let stamps = backfill_timestamps(&explicit, Utc::now(), collector_step(&state));
    for (payload, ts) in payloads.iter_mut().zip(stamps) {
        payload.timestamp = Some(ts);
    }

    Json(state.gateway.receive_batch_data(payloads).await)
}

#[derive(Debug, Deserialize)]
pub struct BandwidthPushPoint {
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub interfaces: BTreeMap<String, InterfaceRates>,
}

#[derive(Debug, Deserialize)]
pub struct BandwidthPush {
    pub device_id: i64,
    pub points: Vec<BandwidthPushPoint>,
}

#[derive(Debug, Deserialize)]
pub struct PingPushPoint {
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub pings: Vec<PingSample>,
}

#[derive(Debug, Deserialize)]
pub struct PingPush {
    pub device_id: i64,
    pub points: Vec<PingPushPoint>,
}

#[derive(Debug, Default, Serialize)]
pub struct PushResponse {
    pub success: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: Vec<String>,
}

impl PushResponse {
    fn absorb(&mut self, outcome: FanOutOutcome) {
        self.attempted += outcome.attempted;
        self.succeeded += outcome.succeeded;
        self.errors.extend(outcome.errors);
    }

    fn finish(mut self) -> Self {
        self.success = !(self.attempted > 0 && self.succeeded == 0);
        self
    }
}

pub async fn handle_push_bandwidth(
    State(state): State<AppState>,
    Json(push): Json<BandwidthPush>,
) -> Result<Json<PushResponse>> {
    let stamps = point_timestamps(&state, push.points.iter().map(|p| p.timestamp))?;

    let mut response = PushResponse::default();
    for (point, ts) in push.points.iter().zip(stamps) {
        let outcome = state
            .gateway
            .process_bandwidth_data(push.device_id, ts.timestamp_millis(), &point.interfaces)
            .await?;
        response.absorb(outcome);
    }
    Ok(Json(response.finish()))
}

pub async fn handle_push_ping(
    State(state): State<AppState>,
    Json(push): Json<PingPush>,
) -> Result<Json<PushResponse>> {
    let stamps = point_timestamps(&state, push.points.iter().map(|p| p.timestamp))?;

    let mut response = PushResponse::default();
    for (point, ts) in push.points.into_iter().zip(stamps) {
        let outcome = state
            .gateway
            .process_ping_data(push.device_id, ts.timestamp_millis(), point.pings)
            .await?;
        response.absorb(outcome);
    }
    Ok(Json(response.finish()))
}

fn collector_step(state: &AppState) -> ChronoDuration {
    ChronoDuration::milliseconds(state.config.collector_interval_ms.max(1))
}

fn point_timestamps(
    state: &AppState,
    millis: impl Iterator<Item = Option<i64>>,
) -> Result<Vec<DateTime<Utc>>> {
    let explicit = millis
        .map(|ms| match ms {
            Some(ms) => DateTime::from_timestamp_millis(ms)
                .map(Some)
                .ok_or_else(|| Error::validation("timestamp", "out of range")),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(backfill_timestamps(&explicit, Utc::now(), collector_step(state)))
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub device_id: Option<i64>,
    /// Comma-separated metric names.
    pub metrics: Option<String>,
    /// Comma-separated `key:value` tag filters.
    pub tags: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub range: Option<String>,
    pub granularity: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl HistoryParams {
    fn into_request(self) -> Result<HistoryRequest> {
        Ok(HistoryRequest {
            device_id: self.device_id,
            metrics: split_list(self.metrics.as_deref()),
            start_time: parse_time("start_time", self.start_time.as_deref())?,
            end_time: parse_time("end_time", self.end_time.as_deref())?,
            range: self.range,
            granularity: self.granularity,
            tags: parse_tags(self.tags.as_deref())?,
            page: self.page.unwrap_or(0),
            limit: self.limit.unwrap_or(0),
        })
    }
}

pub async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>> {
    let request = params.into_request()?;
    Ok(Json(state.query.query_historical_data(&request).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChartParams {
    pub range: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub interface: Option<String>,
    pub target: Option<String>,
    pub source_interface: Option<String>,
}

impl ChartParams {
    fn chart_request(&self) -> Result<ChartRequest> {
        Ok(ChartRequest {
            range: self.range.clone(),
            start_time: parse_time("start_time", self.start_time.as_deref())?,
            end_time: parse_time("end_time", self.end_time.as_deref())?,
        })
    }
}

pub async fn handle_bandwidth(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ChartParams>,
) -> Result<Json<BandwidthHistory>> {
    let request = params.chart_request()?;
    let history = state
        .query
        .query_bandwidth(id, params.interface.as_deref(), &request)
        .await?;
    Ok(Json(history))
}

pub async fn handle_ping(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ChartParams>,
) -> Result<Json<PingHistory>> {
    let request = params.chart_request()?;
    let history = state
        .query
        .query_ping(
            id,
            params.target.as_deref(),
            params.source_interface.as_deref(),
            &request,
        )
        .await?;
    Ok(Json(history))
}

pub async fn handle_total_traffic(
    State(state): State<AppState>,
    Query(params): Query<ChartParams>,
) -> Result<Json<TotalTraffic>> {
    let request = params.chart_request()?;
    Ok(Json(state.query.query_total_traffic(&request).await?))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    pub metric: String,
    pub window_secs: Option<i64>,
}

pub async fn handle_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<MetricSummary>> {
    let window = ChronoDuration::try_seconds(params.window_secs.unwrap_or(3600))
        .ok_or_else(|| Error::validation("window_secs", "must be between 1s and 24h"))?;
    Ok(Json(state.query.metric_summary(id, &params.metric, window).await?))
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    /// Comma-separated device ids.
    pub ids: String,
}

pub async fn handle_device_statuses(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<Vec<DeviceStatusEntry>>> {
    let ids = split_list(Some(params.ids.as_str()))
        .iter()
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| Error::validation("ids", format!("{:?} is not a device id", s)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Json(state.query.device_statuses(&ids).await?))
}

pub async fn handle_online_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>> {
    Ok(Json(state.query.online_devices().await?))
}

#[derive(Debug, Serialize)]
pub struct LivenessCheck {
    pub device_id: i64,
    #[serde(flatten)]
    pub reading: LivenessReading,
    pub offline_timeout_secs: u64,
}

/// Evaluate one device now, persisting a status change.
pub async fn handle_check_liveness(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<LivenessCheck>> {
    let reading = state.monitor.check_single_device(id).await?;
    Ok(Json(LivenessCheck {
        device_id: id,
        reading,
        offline_timeout_secs: state.monitor.offline_timeout().as_secs(),
    }))
}

// ============================================================================
// Cleanup
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub deleted: u64,
}

fn cleaned(deleted: u64) -> Json<CleanupResponse> {
    Json(CleanupResponse {
        success: true,
        deleted,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceCleanupParams {
    pub before: Option<String>,
}

pub async fn handle_cleanup_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<DeviceCleanupParams>,
) -> Result<Json<CleanupResponse>> {
    let deleted = match parse_time("before", params.before.as_deref())? {
        Some(cutoff) => state.cleanup.cleanup_device_data_before(id, cutoff).await?,
        None => state.cleanup.cleanup_device_data(id).await?,
    };
    Ok(cleaned(deleted))
}

pub async fn handle_cleanup_interface(
    State(state): State<AppState>,
    Path((id, name)): Path<(i64, String)>,
) -> Result<Json<CleanupResponse>> {
    Ok(cleaned(state.cleanup.cleanup_interface_data(id, &name).await?))
}

#[derive(Debug, Deserialize)]
pub struct PingTargetCleanupParams {
    pub target: String,
    pub source_interface: Option<String>,
}

pub async fn handle_cleanup_ping_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PingTargetCleanupParams>,
) -> Result<Json<CleanupResponse>> {
    let deleted = state
        .cleanup
        .cleanup_ping_target_data(id, &params.target, params.source_interface.as_deref())
        .await?;
    Ok(cleaned(deleted))
}

#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    pub retention_days: i64,
}

pub async fn handle_cleanup_expired(
    State(state): State<AppState>,
    Json(req): Json<RetentionRequest>,
) -> Result<Json<CleanupResponse>> {
    Ok(cleaned(state.cleanup.cleanup_expired_data(req.retention_days).await?))
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let series = state.series.health().await;
    let cache = state.cache.health().await;

    let describe = |r: &Result<(), StoreError>| match r {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    let healthy = series.is_ok() && cache.is_ok();
    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "series": describe(&series),
        "cache": describe(&cache),
    }));

    if healthy {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn parse_time(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| Error::validation(field, format!("{:?} is not an ISO-8601 timestamp", s))),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_tags(raw: Option<&str>) -> Result<BTreeMap<String, String>> {
    split_list(raw)
        .into_iter()
        .map(|pair| match pair.split_once(':') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(Error::validation("tags", format!("{:?} is not key:value", pair))),
        })
        .collect()
}
