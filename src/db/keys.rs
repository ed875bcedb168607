//! Cache key scheme and time-series measurement names.
//!
//! Other services read these keys directly, so the layout is fixed.

pub const MEASUREMENT_METRICS: &str = "device_metrics";
pub const MEASUREMENT_BANDWIDTH: &str = "bandwidth";
pub const MEASUREMENT_PING: &str = "ping";

/// Every measurement the cleanup engine knows about.
pub const ALL_MEASUREMENTS: [&str; 3] =
    [MEASUREMENT_BANDWIDTH, MEASUREMENT_PING, MEASUREMENT_METRICS];

pub const TAG_DEVICE_ID: &str = "device_id";
pub const TAG_INTERFACE: &str = "interface";
pub const TAG_TARGET_ADDRESS: &str = "target_address";
pub const TAG_SOURCE_INTERFACE: &str = "source_interface";

pub const FIELD_RX_RATE: &str = "rx_rate";
pub const FIELD_TX_RATE: &str = "tx_rate";
pub const FIELD_LATENCY: &str = "latency";
pub const FIELD_STATUS: &str = "status";

pub fn latest(device_id: i64) -> String {
    format!("device:latest:{}", device_id)
}

pub fn metric(device_id: i64, name: &str) -> String {
    format!("device:metric:{}:{}", device_id, name)
}

pub fn metric_pattern(device_id: i64) -> String {
    format!("device:metric:{}:*", device_id)
}

pub fn last_seen(device_id: i64) -> String {
    format!("device:last_seen:{}", device_id)
}

pub fn status(device_id: i64) -> String {
    format!("device:status:{}", device_id)
}

pub fn bandwidth(device_id: i64) -> String {
    format!("device:bandwidth:{}", device_id)
}

pub fn bandwidth_interface(device_id: i64, interface: &str) -> String {
    format!("device:bandwidth:{}:{}", device_id, interface)
}

pub fn bandwidth_pattern(device_id: i64) -> String {
    format!("device:bandwidth:{}:*", device_id)
}

pub fn ping(device_id: i64) -> String {
    format!("device:ping:{}", device_id)
}

/// Per-target ping key; the source interface is appended with `_` when set.
pub fn ping_target(device_id: i64, target: &str, source_interface: Option<&str>) -> String {
    match source_interface {
        Some(iface) if !iface.is_empty() => {
            format!("device:ping:{}:{}_{}", device_id, target, iface)
        }
        _ => format!("device:ping:{}:{}", device_id, target),
    }
}

/// Every source-interface key of one ping target.
pub fn ping_target_pattern(device_id: i64, target: &str) -> String {
    format!("device:ping:{}:{}_*", device_id, target)
}

pub fn ping_pattern(device_id: i64) -> String {
    format!("device:ping:{}:*", device_id)
}

pub fn ip(addr: &str) -> String {
    format!("device:ip:{}", addr)
}

pub fn exists(device_id: i64) -> String {
    format!("device:exists:{}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(latest(7), "device:latest:7");
        assert_eq!(metric(7, "cpu"), "device:metric:7:cpu");
        assert_eq!(last_seen(7), "device:last_seen:7");
        assert_eq!(status(7), "device:status:7");
        assert_eq!(bandwidth(7), "device:bandwidth:7");
        assert_eq!(bandwidth_interface(7, "ether1"), "device:bandwidth:7:ether1");
        assert_eq!(ping(7), "device:ping:7");
        assert_eq!(ping_target(7, "8.8.8.8", None), "device:ping:7:8.8.8.8");
        assert_eq!(ping_target(7, "8.8.8.8", Some("")), "device:ping:7:8.8.8.8");
        assert_eq!(
            ping_target(7, "8.8.8.8", Some("wan")),
            "device:ping:7:8.8.8.8_wan"
        );
        assert_eq!(ip("10.0.0.1"), "device:ip:10.0.0.1");
        assert_eq!(exists(7), "device:exists:7");
    }
}
