use thiserror::Error;

/// Adapter failures, classified by what the runtime does next: `Config`
/// rejects the adapter, `Connect` reconnects with backoff, `Transient` is
/// retried within the polling tick, `Protocol` becomes a BAD-quality sample.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transient read error: {0}")]
    Transient(String),

    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        /// Protocol-specific code (e.g. a modbus exception), surfaced as the
        /// sample's `quality_code`.
        code: Option<i64>,
    },
}

impl AdapterError {
    pub fn protocol(message: impl Into<String>) -> Self {
        AdapterError::Protocol {
            message: message.into(),
            code: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// Errors that invalidate the session and require a reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, AdapterError::Connect(_))
    }

    pub fn quality_code(&self) -> Option<i64> {
        match self {
            AdapterError::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}
