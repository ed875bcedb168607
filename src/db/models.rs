//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scalar metric or field value.
///
/// Variant order matters for untagged deserialization: booleans and
/// integers must be tried before floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetricValue {
    /// Numeric view of the value; strings and booleans have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(f) => Some(*f),
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Str(_) | MetricValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Storage kind tag persisted next to the value.
    pub fn kind(&self) -> &'static str {
        match self {
            MetricValue::Bool(_) => "bool",
            MetricValue::Int(_) => "int",
            MetricValue::Float(_) => "float",
            MetricValue::Str(_) => "str",
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Str(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Str(v)
    }
}

/// Online state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "unknown" | "" => Ok(DeviceStatus::Unknown),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// A registered network device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    /// Management address the agent pushes from.
    pub host: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: String::new(),
            status: DeviceStatus::Unknown,
            last_seen: None,
        }
    }
}

/// Minimal identity cached per address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: i64,
    pub name: String,
    pub host: String,
}

impl From<&Device> for DeviceIdentity {
    fn from(d: &Device) -> Self {
        Self {
            id: d.id,
            name: d.name.clone(),
            host: d.host.clone(),
        }
    }
}

/// Push collector attached to a device.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collector {
    pub id: i64,
    pub device_id: i64,
    pub push_count: i64,
    pub last_push_at: Option<DateTime<Utc>>,
}

/// Filters for listing devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    /// Substring match on name or host.
    pub search: Option<String>,
}
