use skiff_domain::DomainError;
use skiff_driver::DriverError;
use skiff_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Rejected target document; the previous target is retained.
    #[error("invalid target state: {0}")]
    Config(#[from] DomainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The runtime itself is unreachable; the whole pass aborts and is
    /// retried after a delay.
    #[error("container runtime unavailable: {0}")]
    RuntimeDown(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}
