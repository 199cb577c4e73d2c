use skiff_http::HttpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity or 5xx; the loop backs off and retries.
    #[error("transient cloud failure: {0}")]
    Transient(String),

    /// 4xx; surfaced and logged, the loop continues at its normal cadence.
    #[error("cloud rejected request with status {0}")]
    Permanent(u16),

    /// Semantically invalid cloud data; the offending document is discarded
    /// and the previous target retained.
    #[error("cloud protocol error: {0}")]
    Protocol(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<HttpError> for SyncError {
    fn from(e: HttpError) -> Self {
        if e.is_transient() {
            SyncError::Transient(e.to_string())
        } else {
            SyncError::Protocol(e.to_string())
        }
    }
}
