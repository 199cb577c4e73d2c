use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_domain::{AppId, Service, ServiceStatus};
use skiff_store::canonical_hash;

/// Label namespace reserved for containers this agent manages.
pub const LABEL_APP_ID: &str = "io.skiff.app-id";
pub const LABEL_SERVICE_ID: &str = "io.skiff.service-id";
pub const LABEL_MANAGED_BY: &str = "io.skiff.managed";
pub const LABEL_CONFIG_HASH: &str = "io.skiff.config-hash";
pub const MANAGED_BY_AGENT: &str = "agent";

/// Filter selecting every container previously created by the agent.
pub fn managed_filter() -> Vec<(String, String)> {
    vec![(LABEL_MANAGED_BY.to_string(), MANAGED_BY_AGENT.to_string())]
}

/// Deterministic container name for a service.
pub fn container_name(app_id: AppId, service: &Service) -> String {
    format!("{}_{}", app_id, service.service_id)
}

/// Stable fingerprint of a service's container spec, recorded as a label on
/// the container and compared on reconcile to detect spec drift.
pub fn config_fingerprint(service: &Service) -> String {
    canonical_hash(&service.config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Collapse the runtime's state into the service-level view reported to
    /// the cloud.
    pub fn as_service_status(self) -> ServiceStatus {
        match self {
            ContainerState::Created => ServiceStatus::Creating,
            ContainerState::Running => ServiceStatus::Running,
            ContainerState::Paused => ServiceStatus::Paused,
            ContainerState::Exited | ContainerState::Dead => ServiceStatus::Exited,
            ContainerState::Removing | ContainerState::Unknown => ServiceStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Removing => "removing",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Digest of the image actually running, when the runtime reports one.
    pub image_digest: Option<String>,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Runtime-agnostic creation request, converted from a [`Service`] spec.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub restart: Option<String>,
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
}

impl CreateSpec {
    pub fn for_service(app_id: AppId, service: &Service) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP_ID.to_string(), app_id.to_string());
        labels.insert(LABEL_SERVICE_ID.to_string(), service.service_id.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_AGENT.to_string());
        labels.insert(LABEL_CONFIG_HASH.to_string(), config_fingerprint(service));

        let cfg = &service.config;
        CreateSpec {
            name: container_name(app_id, service),
            image: service.image_name.clone(),
            labels,
            ports: cfg.ports.clone(),
            volumes: cfg.volumes.clone(),
            environment: cfg.environment.clone(),
            restart: cfg.restart.clone(),
            network_mode: cfg.network_mode.clone(),
            privileged: cfg.privileged,
            command: cfg.command.clone(),
            entrypoint: cfg.entrypoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::{DesiredState, ServiceConfig, ServiceId};

    fn service(id: &str, ports: &[&str]) -> Service {
        Service {
            service_id: ServiceId::new(id),
            service_name: id.to_string(),
            image_name: "nginx:1.25".into(),
            desired_state: DesiredState::Running,
            config: ServiceConfig {
                ports: ports.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            },
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn create_spec_carries_reserved_labels() {
        let svc = service("s1", &["80:80"]);
        let spec = CreateSpec::for_service(AppId(1001), &svc);
        assert_eq!(spec.name, "1001_s1");
        assert_eq!(spec.labels[LABEL_APP_ID], "1001");
        assert_eq!(spec.labels[LABEL_SERVICE_ID], "s1");
        assert_eq!(spec.labels[LABEL_MANAGED_BY], "agent");
        assert_eq!(spec.labels[LABEL_CONFIG_HASH], config_fingerprint(&svc));
    }

    #[test]
    fn fingerprint_tracks_config_not_image() {
        let a = service("s1", &["80:80"]);
        let mut b = service("s1", &["8080:80"]);
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));

        b.config.ports = vec!["80:80".into()];
        b.image_name = "nginx:1.27".into();
        // image changes are detected separately, not via the fingerprint
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));
    }
}
