use serde::{Deserialize, Serialize};

/// Closed set of logging components. Records are tagged by mapping the
/// tracing target (module path) of the emitting code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Agent,
    ContainerManager,
    StateReconciler,
    CloudSync,
    Mqtt,
    Provisioning,
    Database,
    Anomaly,
    Adapter,
    Api,
}

impl Component {
    pub fn from_target(target: &str) -> Component {
        // Submodule tags win over crate prefixes.
        if target.contains("mqtt") {
            return Component::Mqtt;
        }
        if target.contains("anomaly") {
            return Component::Anomaly;
        }
        match target.split("::").next().unwrap_or(target) {
            "skiff_store" => Component::Database,
            "skiff_driver" => Component::ContainerManager,
            "skiff_reconciler" => Component::StateReconciler,
            "skiff_sync" => Component::CloudSync,
            "skiff_provision" => Component::Provisioning,
            "skiff_adapters" => Component::Adapter,
            "skiff_api" => Component::Api,
            _ => Component::Agent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Agent => "agent",
            Component::ContainerManager => "container-manager",
            Component::StateReconciler => "state-reconciler",
            Component::CloudSync => "cloud-sync",
            Component::Mqtt => "mqtt",
            Component::Provisioning => "provisioning",
            Component::Database => "database",
            Component::Anomaly => "anomaly",
            Component::Adapter => "adapter",
            Component::Api => "api",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
