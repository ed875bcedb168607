//! Sample types accepted by the ingestion gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::MetricValue;
use crate::error::{Error, Result};

/// A generic metric push as it arrives from an agent.
///
/// Values are still untyped JSON here; [`MetricSample::from_payload`]
/// narrows them to [`MetricValue`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricPayload {
    /// Numeric device id or the device's management address.
    pub device_id: String,
    /// Milliseconds since the epoch; `None` means "now".
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A validated metric sample. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricValue>,
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    /// Validate a payload and narrow its values to scalars.
    pub fn from_payload(payload: MetricPayload, now: DateTime<Utc>) -> Result<Self> {
        let device_id = payload.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(Error::validation("device_id", "is required"));
        }
        if payload.metrics.is_empty() {
            return Err(Error::validation("metrics", "must contain at least one metric"));
        }

        let mut metrics = BTreeMap::new();
        for (name, raw) in payload.metrics {
            if name.trim().is_empty() {
                return Err(Error::validation("metrics", "metric names must not be empty"));
            }
            let value = scalar_from_json(&name, raw)?;
            metrics.insert(name, value);
        }

        Ok(Self {
            device_id,
            timestamp: payload.timestamp.unwrap_or(now),
            metrics,
            tags: payload.tags,
        })
    }
}

fn scalar_from_json(name: &str, raw: serde_json::Value) -> Result<MetricValue> {
    use serde_json::Value;

    match raw {
        Value::Bool(b) => Ok(MetricValue::Bool(b)),
        Value::String(s) => Ok(MetricValue::Str(s)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(MetricValue::Int(i))
            } else if let Some(f) = n.as_f64().filter(|f| f.is_finite()) {
                Ok(MetricValue::Float(f))
            } else {
                Err(Error::validation(
                    format!("metrics.{}", name),
                    "number is out of range",
                ))
            }
        }
        Value::Null => Err(Error::validation(format!("metrics.{}", name), "null is not a scalar")),
        Value::Array(_) | Value::Object(_) => Err(Error::validation(
            format!("metrics.{}", name),
            "only float, integer, string and boolean values are supported",
        )),
    }
}

/// Receive and transmit rates of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterfaceRates {
    pub rx_rate: f64,
    pub tx_rate: f64,
}

impl InterfaceRates {
    pub fn is_valid(&self) -> bool {
        self.rx_rate.is_finite() && self.tx_rate.is_finite() && self.rx_rate >= 0.0 && self.tx_rate >= 0.0
    }
}

/// Per-device bandwidth snapshot, interface name to rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub timestamp: DateTime<Utc>,
    pub interfaces: BTreeMap<String, InterfaceRates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Up,
    Down,
}

impl PingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingStatus::Up => "up",
            PingStatus::Down => "down",
        }
    }
}

/// One ping measurement against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub target_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default)]
    pub source_interface: String,
    /// Round trip in milliseconds; 0 means the ping was lost.
    pub latency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PingStatus>,
}

impl PingSample {
    /// A sample needs a target and a finite, non-negative latency.
    pub fn is_valid(&self) -> bool {
        !self.target_address.is_empty() && self.latency.is_finite() && self.latency >= 0.0
    }

    /// Fill in a missing status and keep `latency == 0` equivalent to `down`.
    pub fn normalized(mut self) -> Self {
        let status = match self.status {
            Some(s) => s,
            None if self.latency > 0.0 => PingStatus::Up,
            None => PingStatus::Down,
        };
        let status = if self.latency == 0.0 { PingStatus::Down } else { status };
        if status == PingStatus::Down {
            self.latency = 0.0;
        }
        self.status = Some(status);
        self
    }

    /// Series key: the target, suffixed with `_<iface>` when a source interface is set.
    pub fn series_key(&self) -> String {
        ping_series_key(&self.target_address, &self.source_interface)
    }
}

pub fn ping_series_key(target_address: &str, source_interface: &str) -> String {
    if source_interface.is_empty() {
        target_address.to_string()
    } else {
        format!("{}_{}", target_address, source_interface)
    }
}

/// Cached snapshot of the most recent ping push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSnapshot {
    pub timestamp: DateTime<Utc>,
    pub pings: Vec<PingSample>,
}

/// Result of a per-item fan-out that continues past failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanOutOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: Vec<String>,
}

impl FanOutOutcome {
    pub fn success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn failure(&mut self, error: impl Into<String>) {
        self.attempted += 1;
        self.errors.push(error.into());
    }

    pub fn failed(&self) -> usize {
        self.attempted - self.succeeded
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded == self.attempted
    }
}

/// Aggregate response of a batch push.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub processed_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
}

impl BatchResponse {
    /// Overall success is false only when every item failed.
    pub fn from_outcome(outcome: &FanOutOutcome) -> Self {
        Self {
            success: !(outcome.attempted > 0 && outcome.succeeded == 0),
            processed_count: outcome.succeeded,
            failed_count: outcome.failed(),
            errors: outcome.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(metrics: serde_json::Value) -> MetricPayload {
        MetricPayload {
            device_id: "1".into(),
            timestamp: None,
            metrics: serde_json::from_value(metrics).unwrap(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_from_payload_narrows_scalars() {
        let now = Utc::now();
        let sample = MetricSample::from_payload(
            payload(json!({"cpu": 12.5, "uptime": 3600, "board": "rb5009", "fan_ok": true})),
            now,
        )
        .unwrap();
        assert_eq!(sample.timestamp, now);
        assert_eq!(sample.metrics["cpu"], MetricValue::Float(12.5));
        assert_eq!(sample.metrics["uptime"], MetricValue::Int(3600));
        assert_eq!(sample.metrics["board"], MetricValue::Str("rb5009".into()));
        assert_eq!(sample.metrics["fan_ok"], MetricValue::Bool(true));
    }

    #[test]
    fn test_from_payload_rejects_unknown_kinds() {
        let err = MetricSample::from_payload(payload(json!({"cpu": [1, 2]})), Utc::now()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid metrics.cpu: only float, integer, string and boolean values are supported"
        );
        let err = MetricSample::from_payload(payload(json!({"cpu": null})), Utc::now()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_from_payload_required_fields() {
        let mut p = payload(json!({"cpu": 1}));
        p.device_id = " ".into();
        let err = MetricSample::from_payload(p, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("device_id"));

        let err = MetricSample::from_payload(payload(json!({})), Utc::now()).unwrap_err();
        assert!(err.to_string().contains("metrics"));
    }

    #[test]
    fn test_payload_timestamp_is_milliseconds() {
        let p: MetricPayload = serde_json::from_value(json!({
            "device_id": "3",
            "timestamp": 1_704_110_400_123i64,
            "metrics": {"cpu": 1}
        }))
        .unwrap();
        assert_eq!(p.timestamp.unwrap().timestamp_millis(), 1_704_110_400_123);
    }

    #[test]
    fn test_ping_normalization() {
        let base = PingSample {
            target_address: "8.8.8.8".into(),
            target_name: None,
            source_interface: String::new(),
            latency: 12.0,
            status: None,
        };
        assert_eq!(base.clone().normalized().status, Some(PingStatus::Up));

        let lost = PingSample { latency: 0.0, ..base.clone() }.normalized();
        assert_eq!(lost.status, Some(PingStatus::Down));
        assert_eq!(lost.latency, 0.0);

        let down = PingSample { status: Some(PingStatus::Down), ..base.clone() }.normalized();
        assert_eq!(down.latency, 0.0);

        let up_zero = PingSample { latency: 0.0, status: Some(PingStatus::Up), ..base.clone() }.normalized();
        assert_eq!(up_zero.status, Some(PingStatus::Down));
    }

    #[test]
    fn test_ping_validity() {
        let base = PingSample {
            target_address: "8.8.8.8".into(),
            target_name: None,
            source_interface: String::new(),
            latency: 0.0,
            status: None,
        };
        assert!(base.is_valid());
        assert!(!PingSample { latency: -1.0, ..base.clone() }.is_valid());
        assert!(!PingSample { latency: f64::NAN, ..base.clone() }.is_valid());
        assert!(!PingSample { latency: f64::INFINITY, ..base.clone() }.is_valid());
        assert!(!PingSample { target_address: String::new(), ..base }.is_valid());
    }

    #[test]
    fn test_series_key() {
        assert_eq!(ping_series_key("1.1.1.1", ""), "1.1.1.1");
        assert_eq!(ping_series_key("1.1.1.1", "wan"), "1.1.1.1_wan");
    }

    #[test]
    fn test_batch_response_partial_vs_total_failure() {
        let mut outcome = FanOutOutcome::default();
        outcome.success();
        outcome.failure("boom");
        let resp = BatchResponse::from_outcome(&outcome);
        assert!(resp.success);
        assert_eq!((resp.processed_count, resp.failed_count), (1, 1));

        let mut all_bad = FanOutOutcome::default();
        all_bad.failure("a");
        all_bad.failure("b");
        assert!(!BatchResponse::from_outcome(&all_bad).success);
        assert!(BatchResponse::from_outcome(&FanOutOutcome::default()).success);
    }
}
