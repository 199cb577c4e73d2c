use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Sensor configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Client-initiated reads on `poll_interval_ms`.
    #[default]
    Poll,
    /// Server push; the session delivers samples as they arrive.
    Subscription,
}

/// One configured data point on a sensor endpoint. `address` is
/// protocol-specific (e.g. `hr:100` for a modbus holding register).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub data_type: Option<String>,
}

/// Cloud-managed definition of one sensor endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Cloud-assigned stable id.
    pub config_id: String,
    pub name: String,
    /// Protocol tag resolved against the adapter registry ("modbus", "sim", …).
    pub protocol: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub mode: AcquisitionMode,
    /// Protocol-specific connection parameters (host, port, unit id, …).
    #[serde(default)]
    pub connection: BTreeMap<String, Value>,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

// ── Sensor output ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Csv,
}

/// Where and how a protocol's samples are written locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorOutput {
    pub protocol: String,
    /// Unix-domain socket path the adapter listens on.
    pub socket_path: PathBuf,
    #[serde(default)]
    pub format: WireFormat,
    /// Record delimiter appended after each sample.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
    #[serde(default = "default_true")]
    pub include_device_name: bool,
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

// ── Samples ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Good => write!(f, "GOOD"),
            Quality::Uncertain => write!(f, "UNCERTAIN"),
            Quality::Bad => write!(f, "BAD"),
        }
    }
}

/// One reading emitted by an adapter. `value` is `None` when the read failed
/// and the sample only carries quality information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_name: String,
    pub register_name: String,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_code: Option<i64>,
}

// ── Anomaly history ───────────────────────────────────────────────────────────

/// Append-only record of a notable lifecycle failure. `id` is the store
/// sequence number, assigned on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    #[serde(default)]
    pub id: u64,
    pub at: DateTime<Utc>,
    pub component: String,
    pub kind: String,
    #[serde(default)]
    pub service: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Quality::Good).unwrap(), "\"GOOD\"");
        assert_eq!(serde_json::to_string(&Quality::Bad).unwrap(), "\"BAD\"");
        let q: Quality = serde_json::from_str("\"UNCERTAIN\"").unwrap();
        assert_eq!(q, Quality::Uncertain);
    }

    #[test]
    fn sensor_config_defaults() {
        let cfg: SensorConfig = serde_json::from_str(
            r#"{"config_id":"c1","name":"plc-7","protocol":"modbus"}"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.poll_interval_ms, 1_000);
        assert_eq!(cfg.mode, AcquisitionMode::Poll);
        assert!(cfg.data_points.is_empty());
    }

    #[test]
    fn null_value_sample_round_trips() {
        let sample = Sample {
            device_name: "plc-7".into(),
            register_name: "temp".into(),
            value: None,
            unit: None,
            timestamp: Utc::now(),
            quality: Quality::Bad,
            quality_code: Some(4),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert!(json["value"].is_null());
        let back: Sample = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample);
    }
}
