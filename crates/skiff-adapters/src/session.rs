use async_trait::async_trait;
use skiff_domain::{DataPoint, SensorConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;

/// One live connection to a sensor endpoint.
///
/// Sessions are not required to tolerate concurrent requests: the runtime
/// wraps every session in a FIFO mutex so reads, probes, and keep-alives are
/// strictly serialized in submission order.
#[async_trait]
pub trait ProtocolSession: Send {
    /// Probe one configured point. Run once per point at activation; points
    /// that fail are marked invalid and skipped for the session.
    async fn probe(&mut self, point: &DataPoint) -> Result<(), AdapterError>;

    /// Read the current raw scalar value of a point; the runtime applies
    /// the configured scale.
    async fn read(&mut self, point: &DataPoint) -> Result<f64, AdapterError>;

    fn supports_subscription(&self) -> bool {
        false
    }

    /// Run a server-push subscription, emitting `(register_name, value)`
    /// pairs until cancelled. Only called when `supports_subscription`.
    async fn subscribe(
        &mut self,
        _points: &[DataPoint],
        _tx: mpsc::Sender<(String, f64)>,
        _cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Config(
            "subscription mode not supported by this protocol".into(),
        ))
    }

    async fn close(&mut self) {}
}

/// Factory for sessions of one protocol. Implementations are selected at
/// build time by feature flags and looked up by tag in the registry.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + 'static {
    fn protocol(&self) -> &'static str;

    async fn connect(
        &self,
        config: &SensorConfig,
    ) -> Result<Box<dyn ProtocolSession>, AdapterError>;
}
