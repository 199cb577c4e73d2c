use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file exists but cannot be read. Fatal on boot: the agent
    /// surfaces it to the operator instead of wiping anything.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("no identity record")]
    IdentityMissing,

    #[error("sensor config not found: {0}")]
    SensorConfigNotFound(String),

    #[error("migration '{id}' failed: {message}")]
    MigrationFailed { id: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        match e {
            redb::DatabaseError::Storage(redb::StorageError::Corrupted(msg)) => {
                StoreError::Corrupt(msg)
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        match e {
            redb::StorageError::Corrupted(msg) => StoreError::Corrupt(msg),
            other => StoreError::Internal(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Internal(e.to_string())
    }
}
