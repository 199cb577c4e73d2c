use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use skiff_domain::{AnomalyRecord, Identity, SensorConfig, SensorOutput, TargetState};
use tracing::debug;

use crate::error::StoreError;
use crate::migrations;
use crate::state::{canonical_hash, StoredTargetState};
use crate::store::DeviceStore;

pub(crate) const IDENTITY: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
pub(crate) const TARGET_STATE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("target_state");
pub(crate) const SENSOR_CONFIGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("sensor_configs");
pub(crate) const SENSOR_OUTPUTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("sensor_outputs");
pub(crate) const ANOMALIES: TableDefinition<u64, &[u8]> = TableDefinition::new("anomalies");
pub(crate) const MIGRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("migrations");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const IDENTITY_KEY: &str = "device";
const TARGET_KEY: &str = "current";
const ANOMALY_SEQ: &str = "anomaly_seq";
const TARGET_VERSION: &str = "target_version";

/// Persistent device store backed by a single redb file at
/// `<data_dir>/device.db`. Everything the agent must remember across
/// restarts lives here.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database. Parent directories are created; a
    /// corrupt existing file surfaces as [`StoreError::Corrupt`] and is
    /// never silently recreated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let db = Database::create(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read_blob<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read()?;
        let table = match rtxn.open_table(table) {
            Ok(t) => t,
            // Table not created yet: same as empty.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn write_blob<T: serde::Serialize>(
        &self,
        table: TableDefinition<&'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self.db.begin_write()?;
        {
            let mut table = wtxn.open_table(table)?;
            table.insert(key, bytes.as_slice())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn delete_key(
        &self,
        table: TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write()?;
        {
            let mut table = wtxn.open_table(table)?;
            table.remove(key)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for RedbStore {
    async fn load_identity(&self) -> Result<Option<Identity>, StoreError> {
        self.read_blob(IDENTITY, IDENTITY_KEY)
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.write_blob(IDENTITY, IDENTITY_KEY, identity)
    }

    async fn clear_identity_credentials(&self) -> Result<(), StoreError> {
        let current: Identity = self
            .read_blob(IDENTITY, IDENTITY_KEY)?
            .ok_or(StoreError::IdentityMissing)?;
        self.write_blob(IDENTITY, IDENTITY_KEY, &current.deprovisioned())
    }

    async fn delete_identity(&self) -> Result<(), StoreError> {
        self.delete_key(IDENTITY, IDENTITY_KEY)
    }

    async fn load_target_state(&self) -> Result<Option<StoredTargetState>, StoreError> {
        self.read_blob(TARGET_STATE, TARGET_KEY)
    }

    async fn save_target_state(
        &self,
        target: &TargetState,
    ) -> Result<StoredTargetState, StoreError> {
        let hash = canonical_hash(target);
        let wtxn = self.db.begin_write()?;
        let stored = {
            let mut meta = wtxn.open_table(META)?;
            let version = meta
                .get(TARGET_VERSION)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert(TARGET_VERSION, version)?;

            let stored = StoredTargetState {
                target: target.clone(),
                version,
                hash,
            };
            let bytes = serde_json::to_vec(&stored)?;
            let mut table = wtxn.open_table(TARGET_STATE)?;
            table.insert(TARGET_KEY, bytes.as_slice())?;
            stored
        };
        wtxn.commit()?;
        debug!(version = stored.version, hash = %stored.hash, "target state persisted");
        Ok(stored)
    }

    async fn delete_target_state(&self) -> Result<(), StoreError> {
        self.delete_key(TARGET_STATE, TARGET_KEY)
    }

    async fn list_sensor_configs(&self) -> Result<Vec<SensorConfig>, StoreError> {
        let rtxn = self.db.begin_read()?;
        let table = match rtxn.open_table(SENSOR_CONFIGS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut configs = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            configs.push(serde_json::from_slice(v.value())?);
        }
        Ok(configs)
    }

    async fn upsert_sensor_config(&self, config: &SensorConfig) -> Result<(), StoreError> {
        self.write_blob(SENSOR_CONFIGS, &config.config_id, config)
    }

    async fn delete_sensor_config(&self, config_id: &str) -> Result<(), StoreError> {
        self.delete_key(SENSOR_CONFIGS, config_id)
    }

    async fn load_sensor_output(
        &self,
        protocol: &str,
    ) -> Result<Option<SensorOutput>, StoreError> {
        self.read_blob(SENSOR_OUTPUTS, protocol)
    }

    async fn upsert_sensor_output(&self, output: &SensorOutput) -> Result<(), StoreError> {
        self.write_blob(SENSOR_OUTPUTS, &output.protocol, output)
    }

    async fn append_anomaly(&self, record: &AnomalyRecord) -> Result<u64, StoreError> {
        let wtxn = self.db.begin_write()?;
        let seq = {
            let mut meta = wtxn.open_table(META)?;
            let seq = meta.get(ANOMALY_SEQ)?.map(|g| g.value()).unwrap_or(0) + 1;
            meta.insert(ANOMALY_SEQ, seq)?;

            let mut stamped = record.clone();
            stamped.id = seq;
            let bytes = serde_json::to_vec(&stamped)?;
            let mut anomalies = wtxn.open_table(ANOMALIES)?;
            anomalies.insert(seq, bytes.as_slice())?;
            seq
        };
        wtxn.commit()?;
        Ok(seq)
    }

    async fn recent_anomalies(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AnomalyRecord>, StoreError> {
        let rtxn = self.db.begin_read()?;
        let table = match rtxn.open_table(ANOMALIES) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let record: AnomalyRecord = serde_json::from_slice(v.value())?;
            if record.at >= since {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn run_migrations(&self) -> Result<Vec<String>, StoreError> {
        let mut applied = Vec::new();
        for migration in migrations::all() {
            let wtxn = self.db.begin_write()?;
            let already = {
                let table = wtxn.open_table(MIGRATIONS)?;
                let exists = table.get(migration.id)?.is_some();
                exists
            };
            if already {
                continue;
            }
            (migration.apply)(&wtxn).map_err(|e| StoreError::MigrationFailed {
                id: migration.id.to_string(),
                message: e.to_string(),
            })?;
            {
                let mut table = wtxn.open_table(MIGRATIONS)?;
                let stamp = serde_json::to_vec(&Utc::now())?;
                table.insert(migration.id, stamp.as_slice())?;
            }
            wtxn.commit()?;
            debug!(id = migration.id, "migration applied");
            applied.push(migration.id.to_string());
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("device.db")).unwrap()
    }

    fn dummy_identity() -> Identity {
        Identity::unprovisioned(
            Uuid::new_v4(),
            "bench-pi",
            "raspberrypi4-64",
            "https://cloud.example",
        )
    }

    fn dummy_target(json: &str) -> TargetState {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn identity_upsert_and_load() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.load_identity().await.unwrap().is_none());

        let id = dummy_identity();
        store.save_identity(&id).await.unwrap();
        // idempotent upsert
        store.save_identity(&id).await.unwrap();

        let got = store.load_identity().await.unwrap().unwrap();
        assert_eq!(got.uuid, id.uuid);
    }

    #[tokio::test]
    async fn identity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.db");
        let id = dummy_identity();
        {
            let store = RedbStore::open(&path).unwrap();
            store.save_identity(&id).await.unwrap();
        }
        {
            let store = RedbStore::open(&path).unwrap();
            let got = store.load_identity().await.unwrap();
            assert!(got.is_some(), "identity should survive store reopen");
            assert_eq!(got.unwrap().uuid, id.uuid);
        }
    }

    #[tokio::test]
    async fn target_state_versions_increase() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let t1 = dummy_target(r#"{"apps":{},"config":{}}"#);
        let s1 = store.save_target_state(&t1).await.unwrap();
        assert_eq!(s1.version, 1);

        let t2 = dummy_target(r#"{"apps":{},"config":{"hostname":"pi"}}"#);
        let s2 = store.save_target_state(&t2).await.unwrap();
        assert_eq!(s2.version, 2);
        assert_ne!(s1.hash, s2.hash);

        let loaded = store.load_target_state().await.unwrap().unwrap();
        assert_eq!(loaded, s2);
    }

    #[tokio::test]
    async fn save_target_state_computes_canonical_hash() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let t = dummy_target(r#"{"apps":{},"config":{"b":1,"a":2}}"#);
        let stored = store.save_target_state(&t).await.unwrap();
        assert_eq!(stored.hash, canonical_hash(&t));
    }

    #[tokio::test]
    async fn sensor_config_crud() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let cfg: SensorConfig = serde_json::from_str(
            r#"{"config_id":"c1","name":"plc-7","protocol":"modbus"}"#,
        )
        .unwrap();
        store.upsert_sensor_config(&cfg).await.unwrap();
        assert_eq!(store.list_sensor_configs().await.unwrap().len(), 1);

        store.delete_sensor_config("c1").await.unwrap();
        assert!(store.list_sensor_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn anomalies_get_increasing_ids_and_filter_by_time() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let record = AnomalyRecord {
            id: 0,
            at: Utc::now(),
            component: "state-reconciler".into(),
            kind: "service_failed".into(),
            service: Some("1001/s1".into()),
            message: "image pull failed".into(),
        };
        let a = store.append_anomaly(&record).await.unwrap();
        let b = store.append_anomaly(&record).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let all = store
            .recent_anomalies(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 1);

        let none = store
            .recent_anomalies(Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn migrations_apply_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let first = store.run_migrations().await.unwrap();
        assert!(!first.is_empty());
        let second = store.run_migrations().await.unwrap();
        assert!(second.is_empty(), "migrations must be applied at most once");
    }

    #[tokio::test]
    async fn clear_credentials_keeps_uuid() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut id = dummy_identity();
        id.device_id = Some("d-42".into());
        id.provisioned = true;
        store.save_identity(&id).await.unwrap();

        store.clear_identity_credentials().await.unwrap();
        let got = store.load_identity().await.unwrap().unwrap();
        assert_eq!(got.uuid, id.uuid);
        assert!(got.device_id.is_none());
        assert!(!got.provisioned);
    }

    #[tokio::test]
    async fn sensor_output_upsert_and_load() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.load_sensor_output("modbus").await.unwrap().is_none());

        let out: SensorOutput = serde_json::from_str(
            r#"{"protocol":"modbus","socket_path":"/run/skiff/modbus.sock"}"#,
        )
        .unwrap();
        store.upsert_sensor_output(&out).await.unwrap();
        let got = store.load_sensor_output("modbus").await.unwrap().unwrap();
        assert_eq!(got, out);
    }
}
