use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::types::{ContainerDetail, ContainerSummary, CreateSpec};

/// Minimal capability set over the local container runtime. The real runtime
/// is an external collaborator; the agent only depends on this contract.
#[async_trait]
pub trait ContainerDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Containers matching every label in `label_filter`. Used with the
    /// reserved label namespace to discover containers the agent created.
    async fn list_containers(
        &self,
        label_filter: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, DriverError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, DriverError>;

    /// No-op when the image is already present.
    async fn pull_image(&self, reference: &str) -> Result<(), DriverError>;

    async fn create(&self, spec: &CreateSpec) -> Result<String, DriverError>;

    async fn start(&self, id: &str) -> Result<(), DriverError>;

    /// Graceful signal, then force after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn pause(&self, id: &str) -> Result<(), DriverError>;

    async fn unpause(&self, id: &str) -> Result<(), DriverError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), DriverError>;

    /// Tail of the container's log stream, most recent last.
    async fn container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<String>, DriverError>;
}
