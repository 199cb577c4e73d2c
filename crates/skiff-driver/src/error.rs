use thiserror::Error;

/// Classified driver failures. The reconciler's handling hangs off this
/// classification: `Transient` is retried in-pass, `RuntimeDown` aborts the
/// pass, `ImageUnavailable` leaves the pass partial, `Conflict` on create
/// triggers a force-remove and one retry.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("container runtime unreachable: {0}")]
    RuntimeDown(String),

    #[error("transient runtime error: {0}")]
    Transient(String),

    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}
