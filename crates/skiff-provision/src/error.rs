use skiff_http::HttpError;
use skiff_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid or expired provisioning secret. Never retried; surfaced to
    /// the operator.
    #[error("provisioning denied by cloud (status {status})")]
    Denied { status: u16 },

    /// Connectivity failure during either phase. The orchestrator retries
    /// with backoff.
    #[error("transient network failure during provisioning: {0}")]
    TransientNetwork(String),

    /// Cloud returned a payload that is malformed or missing required
    /// fields. Aborts the attempt.
    #[error("provisioning protocol error: {0}")]
    Protocol(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::TransientNetwork(_))
    }
}

impl From<HttpError> for ProvisionError {
    fn from(e: HttpError) -> Self {
        if e.is_transient() {
            ProvisionError::TransientNetwork(e.to_string())
        } else {
            ProvisionError::Protocol(e.to_string())
        }
    }
}
