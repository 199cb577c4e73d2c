use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Cloud-assigned numeric app id. JSON object keys carry it as a string
/// ("1001"), which serde_json maps back to the integer transparently.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AppId(pub u32);

impl AppId {
    pub fn new(id: u32) -> Self {
        AppId(id)
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(s: impl Into<String>) -> Self {
        ServiceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Declared intent for a service. Absent in JSON means `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
    Paused,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Running => write!(f, "running"),
            DesiredState::Stopped => write!(f, "stopped"),
            DesiredState::Paused => write!(f, "paused"),
        }
    }
}

/// Runtime state of a service as observed through the container driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Missing,
    Creating,
    Running,
    Paused,
    Exited,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Missing => "missing",
            ServiceStatus::Creating => "creating",
            ServiceStatus::Running => "running",
            ServiceStatus::Paused => "paused",
            ServiceStatus::Exited => "exited",
            ServiceStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Three-state view of cloud reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    #[default]
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionHealth::Online => write!(f, "online"),
            ConnectionHealth::Degraded => write!(f, "degraded"),
            ConnectionHealth::Offline => write!(f, "offline"),
        }
    }
}

// ── Service spec ──────────────────────────────────────────────────────────────

/// Container spec for one service. Known fields are typed; anything else the
/// cloud sends is kept verbatim in `extra` so documents round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

// ── Core structs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_name: String,
    #[serde(default)]
    pub desired_state: DesiredState,
    #[serde(default)]
    pub config: ServiceConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub app_id: AppId,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Declarative intent for the whole device, authoritative and cloud-supplied.
///
/// `apps` is a BTreeMap so iteration yields apps in ascending numeric id,
/// the order reconcile passes process them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetState {
    #[serde(default)]
    pub apps: BTreeMap<AppId, App>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TargetState {
    /// Boundary validation run on every document before it is accepted as
    /// the new target. Structural errors reject the whole document; the
    /// previous target is retained.
    pub fn validate(&self) -> Result<(), DomainError> {
        for (key, app) in &self.apps {
            if *key != app.app_id {
                return Err(DomainError::AppIdMismatch {
                    key: key.0,
                    field: app.app_id.0,
                });
            }
            let mut seen = std::collections::HashSet::new();
            for svc in &app.services {
                if svc.service_id.as_str().is_empty() {
                    return Err(DomainError::InvalidServiceId {
                        app_id: app.app_id.0,
                        service_id: svc.service_id.to_string(),
                    });
                }
                if !seen.insert(svc.service_id.clone()) {
                    return Err(DomainError::DuplicateServiceId {
                        app_id: app.app_id.0,
                        service_id: svc.service_id.to_string(),
                    });
                }
                if svc.image_name.is_empty() {
                    return Err(DomainError::InvalidConfig(format!(
                        "service {}/{} has an empty image_name",
                        app.app_id, svc.service_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn service_count(&self) -> usize {
        self.apps.values().map(|a| a.services.len()).sum()
    }
}

// ── Current (observed) state ──────────────────────────────────────────────────

/// Mirror of [`TargetState`] with each service annotated with what the
/// container driver actually reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CurrentState {
    #[serde(default)]
    pub apps: BTreeMap<AppId, AppReport>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppReport {
    pub app_id: AppId,
    pub app_name: String,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_name: String,
    pub desired_state: DesiredState,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}
