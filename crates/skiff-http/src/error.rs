use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    /// Connection-level failure after all retry attempts.
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("response body is not valid JSON: {0}")]
    BadBody(#[from] serde_json::Error),
}

impl HttpError {
    /// True for failures worth retrying at a higher level (the orchestrator's
    /// provisioning loop, the sync loops).
    pub fn is_transient(&self) -> bool {
        matches!(self, HttpError::Network(_) | HttpError::DeadlineExceeded { .. })
    }
}
