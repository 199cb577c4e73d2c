use serde::Serialize;
use skiff_domain::{AppId, ServiceId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceFailure {
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub error: String,
}

/// Outcome of one reconcile pass. A pass is successful iff every action
/// returned success or no-op; otherwise it is partial and counts the
/// per-service failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    /// Services whose state the pass changed.
    pub changed: usize,
    /// Services already matching the target.
    pub unchanged: usize,
    /// Containers removed because their service left the target.
    pub removed: usize,
    pub failed: Vec<ServiceFailure>,
}

impl PassSummary {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}
