use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::Component;

pub const REDACTED: &str = "[REDACTED]";

/// Field-key markers whose values must never reach a sink.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "api_key",
    "secret",
    "private_key",
    "preshared_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            // TRACE is collapsed into debug for the cloud pipeline.
            _ => LogLevel::Debug,
        }
    }
}

/// One structured record as buffered for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: Component,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    /// True when this record's level is subject to a sampling rate below 1.0.
    #[serde(default)]
    pub sampled: bool,
}

/// Replace values of sensitive keys in place. Matching is case-insensitive
/// and substring-based on the key, so `mqtt_password` and
/// `provisioning_secret` are caught too.
pub fn redact_fields(fields: &mut BTreeMap<String, Value>) {
    for (key, value) in fields.iter_mut() {
        let lower = key.to_lowercase();
        if SENSITIVE_KEYS.iter().any(|marker| lower.contains(marker)) {
            *value = Value::String(REDACTED.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_are_redacted() {
        let mut fields = BTreeMap::new();
        fields.insert("mqtt_password".to_string(), Value::String("hunter2".into()));
        fields.insert("api_key".to_string(), Value::String("sk_live_abc".into()));
        fields.insert("provisioning_secret".to_string(), Value::String("ps".into()));
        fields.insert("host".to_string(), Value::String("broker.local".into()));

        redact_fields(&mut fields);

        assert_eq!(fields["mqtt_password"], REDACTED);
        assert_eq!(fields["api_key"], REDACTED);
        assert_eq!(fields["provisioning_secret"], REDACTED);
        assert_eq!(fields["host"], "broker.local");
    }

    #[test]
    fn redaction_is_case_insensitive() {
        let mut fields = BTreeMap::new();
        fields.insert("Private_Key".to_string(), Value::String("pem".into()));
        redact_fields(&mut fields);
        assert_eq!(fields["Private_Key"], REDACTED);
    }

    #[test]
    fn levels_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
