use redb::{ReadableTable, WriteTransaction};

use crate::error::StoreError;
use crate::redb_store::{
    ANOMALIES, IDENTITY, META, MIGRATIONS, SENSOR_CONFIGS, SENSOR_OUTPUTS, TARGET_STATE,
};

/// One schema migration. Ids sort lexically; [`all`] returns them in that
/// order and the store applies each at most once.
pub struct Migration {
    pub id: &'static str,
    pub apply: fn(&WriteTransaction) -> Result<(), StoreError>,
}

pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            id: "0001_create_tables",
            apply: create_tables,
        },
        Migration {
            id: "0002_seed_counters",
            apply: seed_counters,
        },
    ]
}

/// Opening a table inside a write transaction creates it.
fn create_tables(wtxn: &WriteTransaction) -> Result<(), StoreError> {
    wtxn.open_table(IDENTITY)?;
    wtxn.open_table(TARGET_STATE)?;
    wtxn.open_table(SENSOR_CONFIGS)?;
    wtxn.open_table(SENSOR_OUTPUTS)?;
    wtxn.open_table(ANOMALIES)?;
    wtxn.open_table(MIGRATIONS)?;
    wtxn.open_table(META)?;
    Ok(())
}

fn seed_counters(wtxn: &WriteTransaction) -> Result<(), StoreError> {
    let mut meta = wtxn.open_table(META)?;
    if meta.get("anomaly_seq")?.is_none() {
        meta.insert("anomaly_seq", 0u64)?;
    }
    if meta.get("target_version")?.is_none() {
        meta.insert("target_version", 0u64)?;
    }
    Ok(())
}
