use std::sync::Arc;

use skiff_adapters::AdapterSupervisor;
use skiff_driver::ContainerDriver;
use skiff_log::LogHandle;
use skiff_reconciler::Reconciler;
use skiff_store::DeviceStore;
use skiff_sync::{CloudSync, ConnectionMonitor};

/// Defaults used when `POST /provision` omits fields; seeded from the
/// agent's environment configuration.
#[derive(Debug, Clone, Default)]
pub struct ProvisionDefaults {
    pub api_endpoint: Option<String>,
    pub device_name: String,
    pub device_type: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DeviceStore>,
    pub driver: Arc<dyn ContainerDriver>,
    pub reconciler: Arc<Reconciler>,
    pub sync: Arc<CloudSync>,
    pub monitor: Arc<ConnectionMonitor>,
    pub supervisor: Arc<AdapterSupervisor>,
    /// None in tests; the log level then cannot be changed at runtime.
    pub log: Option<LogHandle>,
    pub provision_defaults: Arc<ProvisionDefaults>,
}
