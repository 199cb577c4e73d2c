use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_domain::{AnomalyRecord, Identity, SensorConfig, SensorOutput, TargetState};

use crate::error::StoreError;
use crate::state::{canonical_hash, StoredTargetState};
use crate::store::DeviceStore;

#[derive(Default)]
struct Inner {
    identity: Option<Identity>,
    target: Option<StoredTargetState>,
    sensor_configs: BTreeMap<String, SensorConfig>,
    sensor_outputs: BTreeMap<String, SensorOutput>,
    anomalies: Vec<AnomalyRecord>,
    anomaly_seq: u64,
    migrated: bool,
}

/// In-memory [`DeviceStore`] for tests and fakes. Same semantics as the redb
/// store, nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load_identity(&self) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.lock().unwrap().identity.clone())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.inner.lock().unwrap().identity = Some(identity.clone());
        Ok(())
    }

    async fn clear_identity_credentials(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.identity.as_ref().ok_or(StoreError::IdentityMissing)?;
        inner.identity = Some(current.deprovisioned());
        Ok(())
    }

    async fn delete_identity(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().identity = None;
        Ok(())
    }

    async fn load_target_state(&self) -> Result<Option<StoredTargetState>, StoreError> {
        Ok(self.inner.lock().unwrap().target.clone())
    }

    async fn save_target_state(
        &self,
        target: &TargetState,
    ) -> Result<StoredTargetState, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.target.as_ref().map(|t| t.version).unwrap_or(0) + 1;
        let stored = StoredTargetState {
            target: target.clone(),
            version,
            hash: canonical_hash(target),
        };
        inner.target = Some(stored.clone());
        Ok(stored)
    }

    async fn delete_target_state(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().target = None;
        Ok(())
    }

    async fn list_sensor_configs(&self) -> Result<Vec<SensorConfig>, StoreError> {
        Ok(self.inner.lock().unwrap().sensor_configs.values().cloned().collect())
    }

    async fn upsert_sensor_config(&self, config: &SensorConfig) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .sensor_configs
            .insert(config.config_id.clone(), config.clone());
        Ok(())
    }

    async fn delete_sensor_config(&self, config_id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().sensor_configs.remove(config_id);
        Ok(())
    }

    async fn load_sensor_output(
        &self,
        protocol: &str,
    ) -> Result<Option<SensorOutput>, StoreError> {
        Ok(self.inner.lock().unwrap().sensor_outputs.get(protocol).cloned())
    }

    async fn upsert_sensor_output(&self, output: &SensorOutput) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .sensor_outputs
            .insert(output.protocol.clone(), output.clone());
        Ok(())
    }

    async fn append_anomaly(&self, record: &AnomalyRecord) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.anomaly_seq += 1;
        let mut stamped = record.clone();
        stamped.id = inner.anomaly_seq;
        inner.anomalies.push(stamped);
        Ok(inner.anomaly_seq)
    }

    async fn recent_anomalies(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AnomalyRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .anomalies
            .iter()
            .filter(|r| r.at >= since)
            .cloned()
            .collect())
    }

    async fn run_migrations(&self) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.migrated {
            return Ok(Vec::new());
        }
        inner.migrated = true;
        Ok(crate::migrations::all().iter().map(|m| m.id.to_string()).collect())
    }
}
