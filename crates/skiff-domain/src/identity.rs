use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A credential value. Serializes transparently (the store and the wire need
/// the real bytes) but never prints itself: `Debug`/`Display` show a sentinel
/// so a stray `{:?}` cannot leak a key into a log line.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Secret(s.into())
    }

    /// Deliberately named: call sites that need the raw value read as such.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret(s)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocol {
    #[default]
    Plain,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    #[serde(default)]
    pub protocol: MqttProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    /// PEM bundle trusted for the broker connection, if any.
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle trusted for cloud HTTP, if any.
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_verify() -> bool {
    true
}

/// The single identity row. Created at first boot, filled in by provisioning,
/// destroyed only by factory reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Minted locally at first boot; never changes for the device lifetime.
    pub uuid: Uuid,
    /// Assigned by the cloud on first registration.
    #[serde(default)]
    pub device_id: Option<String>,
    pub device_name: String,
    pub device_type: String,
    /// Cloud base URL.
    pub api_endpoint: String,
    #[serde(default)]
    pub device_api_key: Option<Secret>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub api_tls: Option<TlsConfig>,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// A fresh, unprovisioned identity with a locally minted uuid.
    pub fn unprovisioned(
        uuid: Uuid,
        device_name: impl Into<String>,
        device_type: impl Into<String>,
        api_endpoint: impl Into<String>,
    ) -> Self {
        Identity {
            uuid,
            device_id: None,
            device_name: device_name.into(),
            device_type: device_type.into(),
            api_endpoint: api_endpoint.into(),
            device_api_key: None,
            mqtt: None,
            api_tls: None,
            provisioned: false,
            registered_at: None,
        }
    }

    /// Deprovision keeps uuid and device_api_key, clears everything the
    /// cloud granted at registration.
    pub fn deprovisioned(&self) -> Self {
        Identity {
            uuid: self.uuid,
            device_id: None,
            device_name: self.device_name.clone(),
            device_type: self.device_type.clone(),
            api_endpoint: self.api_endpoint.clone(),
            device_api_key: self.device_api_key.clone(),
            mqtt: None,
            api_tls: None,
            provisioned: false,
            registered_at: None,
        }
    }
}
