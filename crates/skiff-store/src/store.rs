use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_domain::{AnomalyRecord, Identity, SensorConfig, SensorOutput, TargetState};

use crate::error::StoreError;
use crate::state::StoredTargetState;

/// The device's single source of durable truth. One file, one writer at a
/// time, concurrent readers; implementations must make every write atomic.
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    // ── Identity ─────────────────────────────────────────────────────────────

    async fn load_identity(&self) -> Result<Option<Identity>, StoreError>;

    /// Idempotent upsert of the single identity row.
    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Deprovision: keep uuid and device_api_key, clear cloud-granted fields.
    async fn clear_identity_credentials(&self) -> Result<(), StoreError>;

    /// Factory reset support. The next boot is a first boot.
    async fn delete_identity(&self) -> Result<(), StoreError>;

    // ── Target state ─────────────────────────────────────────────────────────

    async fn load_target_state(&self) -> Result<Option<StoredTargetState>, StoreError>;

    /// Atomically replace the whole target document; computes the canonical
    /// hash and bumps the version. Returns the stored row.
    async fn save_target_state(
        &self,
        target: &TargetState,
    ) -> Result<StoredTargetState, StoreError>;

    async fn delete_target_state(&self) -> Result<(), StoreError>;

    // ── Sensor configuration ─────────────────────────────────────────────────

    async fn list_sensor_configs(&self) -> Result<Vec<SensorConfig>, StoreError>;
    async fn upsert_sensor_config(&self, config: &SensorConfig) -> Result<(), StoreError>;
    async fn delete_sensor_config(&self, config_id: &str) -> Result<(), StoreError>;

    async fn load_sensor_output(&self, protocol: &str)
        -> Result<Option<SensorOutput>, StoreError>;
    async fn upsert_sensor_output(&self, output: &SensorOutput) -> Result<(), StoreError>;

    // ── Anomaly history ──────────────────────────────────────────────────────

    /// Append-only; the store assigns the sequence id and returns it.
    async fn append_anomaly(&self, record: &AnomalyRecord) -> Result<u64, StoreError>;
    async fn recent_anomalies(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AnomalyRecord>, StoreError>;

    // ── Migrations ───────────────────────────────────────────────────────────

    /// Apply pending schema migrations in lexical order of their ids, each at
    /// most once. Returns the ids applied by this call. Any failure aborts
    /// startup.
    async fn run_migrations(&self) -> Result<Vec<String>, StoreError>;
}
