use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use skiff_domain::{SensorConfig, SensorOutput, WireFormat};
use skiff_store::DeviceStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::health::AdapterHealth;
use crate::output::{OutputHandle, OutputWriter};
use crate::registry::AdapterRegistry;
use crate::runtime::{AdapterRuntime, RuntimeOptions};

/// Health view for one adapter as returned by [`AdapterSupervisor::health_snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub config_id: String,
    pub name: String,
    pub protocol: String,
    #[serde(flatten)]
    pub health: AdapterHealth,
}

struct AdapterHandle {
    config: SensorConfig,
    health: Arc<RwLock<AdapterHealth>>,
    task: JoinHandle<()>,
}

struct Inner {
    adapters: HashMap<String, AdapterHandle>,
    /// Configs present but disabled; reported with quality `disabled`.
    disabled: HashMap<String, SensorConfig>,
    outputs: HashMap<String, OutputHandle>,
    output_tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Loads enabled sensor configs from the store and owns one adapter task per
/// config plus one output socket per protocol. Lookup and iteration go
/// through snapshots; the handle map never leaks outside the supervisor.
pub struct AdapterSupervisor {
    store: Arc<dyn DeviceStore>,
    registry: Arc<AdapterRegistry>,
    data_dir: PathBuf,
    opts: RuntimeOptions,
    inner: Mutex<Inner>,
}

impl AdapterSupervisor {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        registry: Arc<AdapterRegistry>,
        data_dir: PathBuf,
        opts: RuntimeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            data_dir,
            opts,
            inner: Mutex::new(Inner {
                adapters: HashMap::new(),
                disabled: HashMap::new(),
                outputs: HashMap::new(),
                output_tasks: Vec::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Instantiate an adapter for every enabled config. A config that fails
    /// to start (unknown protocol, bad output path) is skipped with a
    /// warning; the rest still come up. Returns the number started.
    pub async fn start(&self) -> Result<usize, AdapterError> {
        let configs = self
            .store
            .list_sensor_configs()
            .await
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        let mut started = 0;
        for config in configs {
            if !config.enabled {
                debug!(config_id = %config.config_id, "sensor config disabled, skipping");
                self.inner
                    .lock()
                    .unwrap()
                    .disabled
                    .insert(config.config_id.clone(), config);
                continue;
            }
            match self.spawn_adapter(config).await {
                Ok(()) => started += 1,
                Err(e) => warn!(error = %e, "adapter failed to start"),
            }
        }
        info!(adapters = started, "adapter supervisor started");
        Ok(started)
    }

    async fn spawn_adapter(&self, config: SensorConfig) -> Result<(), AdapterError> {
        let adapter = self.registry.get(&config.protocol)?;
        let output = self.output_for(&config.protocol).await?;
        let runtime = AdapterRuntime::new(config.clone(), adapter, output, self.opts.clone());
        let health = runtime.health();

        let mut inner = self.inner.lock().unwrap();
        let cancel = inner.cancel.child_token();
        let task = tokio::spawn(runtime.run(cancel));
        inner.adapters.insert(
            config.config_id.clone(),
            AdapterHandle {
                config,
                health,
                task,
            },
        );
        Ok(())
    }

    /// One socket per protocol, shared by all its adapters. The output spec
    /// comes from the store, with a conventional default under the data dir.
    async fn output_for(&self, protocol: &str) -> Result<OutputHandle, AdapterError> {
        if let Some(handle) = self.inner.lock().unwrap().outputs.get(protocol) {
            return Ok(handle.clone());
        }
        let output = self
            .store
            .load_sensor_output(protocol)
            .await
            .map_err(|e| AdapterError::Config(e.to_string()))?
            .unwrap_or_else(|| SensorOutput {
                protocol: protocol.to_string(),
                socket_path: self.data_dir.join("sensors").join(format!("{protocol}.sock")),
                format: WireFormat::Json,
                delimiter: "\n".to_string(),
                include_timestamp: true,
                include_device_name: true,
            });

        let mut inner = self.inner.lock().unwrap();
        let (handle, task) = OutputWriter::spawn(output, inner.cancel.child_token())?;
        inner.output_tasks.push(task);
        inner.outputs.insert(protocol.to_string(), handle.clone());
        Ok(handle)
    }

    /// Copy of every adapter's health, disabled configs included. Iteration
    /// works on a snapshot of the handles, never on the live map.
    pub fn health_snapshot(&self) -> BTreeMap<String, AdapterStatus> {
        let (snapshot, disabled) = {
            let inner = self.inner.lock().unwrap();
            let snapshot: Vec<(String, SensorConfig, Arc<RwLock<AdapterHealth>>)> = inner
                .adapters
                .iter()
                .map(|(id, h)| (id.clone(), h.config.clone(), h.health.clone()))
                .collect();
            let disabled: Vec<SensorConfig> = inner.disabled.values().cloned().collect();
            (snapshot, disabled)
        };
        let mut statuses: BTreeMap<String, AdapterStatus> = snapshot
            .into_iter()
            .map(|(id, config, health)| {
                let health = health.read().unwrap().clone();
                (
                    id.clone(),
                    AdapterStatus {
                        config_id: id,
                        name: config.name,
                        protocol: config.protocol,
                        health,
                    },
                )
            })
            .collect();
        for config in disabled {
            statuses.insert(
                config.config_id.clone(),
                AdapterStatus {
                    config_id: config.config_id,
                    name: config.name,
                    protocol: config.protocol,
                    health: AdapterHealth::new(false),
                },
            );
        }
        statuses
    }

    pub fn adapter_count(&self) -> usize {
        self.inner.lock().unwrap().adapters.len()
    }

    /// Cancel every adapter and output task and wait for them to finish, so
    /// socket files are unlinked before any restart rebinds them.
    pub async fn stop(&self) {
        let (handles, output_tasks, cancel) = {
            let mut inner = self.inner.lock().unwrap();
            inner.outputs.clear();
            inner.disabled.clear();
            let cancel = std::mem::replace(&mut inner.cancel, CancellationToken::new());
            let handles: Vec<AdapterHandle> =
                inner.adapters.drain().map(|(_, h)| h).collect();
            let output_tasks = std::mem::take(&mut inner.output_tasks);
            (handles, output_tasks, cancel)
        };
        cancel.cancel();
        for handle in handles {
            let _ = handle.task.await;
        }
        for task in output_tasks {
            let _ = task.await;
        }
        info!("adapter supervisor stopped");
    }

    /// Stop everything and start again from the store's current configs.
    pub async fn reload(&self) -> Result<usize, AdapterError> {
        self.stop().await;
        self.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CommunicationQuality;
    use skiff_store::MemoryStore;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixStream;

    fn sim_config(id: &str) -> SensorConfig {
        serde_json::from_value(serde_json::json!({
            "config_id": id,
            "name": "rig",
            "protocol": "sim",
            "poll_interval_ms": 10,
            "data_points": [{"name": "v", "address": "counter"}],
        }))
        .unwrap()
    }

    fn quick_opts() -> RuntimeOptions {
        RuntimeOptions {
            reconnect_base: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn supervisor_with(
        configs: Vec<SensorConfig>,
    ) -> (Arc<AdapterSupervisor>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        for config in &configs {
            store.upsert_sensor_config(config).await.unwrap();
        }
        let supervisor = AdapterSupervisor::new(
            store,
            Arc::new(AdapterRegistry::builtin()),
            dir.path().to_path_buf(),
            quick_opts(),
        );
        (supervisor, dir)
    }

    #[tokio::test]
    async fn runs_adapters_and_serves_samples_on_the_socket() {
        let (supervisor, dir) = supervisor_with(vec![sim_config("c1")]).await;
        assert_eq!(supervisor.start().await.unwrap(), 1);

        let socket = dir.path().join("sensors").join("sim.sock");
        let client = UnixStream::connect(&socket).await.unwrap();
        let mut reader = tokio::io::BufReader::new(client);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("sample should arrive")
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["register_name"], "v");
        assert_eq!(value["quality"], "GOOD");

        let health = supervisor.health_snapshot();
        assert_eq!(health["c1"].protocol, "sim");
        assert_eq!(
            health["c1"].health.communication_quality,
            CommunicationQuality::Good
        );

        supervisor.stop().await;
        assert_eq!(supervisor.adapter_count(), 0);
    }

    #[tokio::test]
    async fn disabled_and_unknown_configs_are_skipped() {
        let mut disabled = sim_config("off");
        disabled.enabled = false;
        let mut unknown = sim_config("mystery");
        unknown.protocol = "opcua".into();

        let (supervisor, _dir) = supervisor_with(vec![disabled, unknown]).await;
        assert_eq!(supervisor.start().await.unwrap(), 0);

        let health = supervisor.health_snapshot();
        assert_eq!(
            health["off"].health.communication_quality,
            CommunicationQuality::Disabled
        );
        assert!(!health.contains_key("mystery"), "unknown protocols are not tracked");
    }

    #[tokio::test]
    async fn reload_picks_up_new_configs() {
        let (supervisor, _dir) = supervisor_with(vec![sim_config("c1")]).await;
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.adapter_count(), 1);

        supervisor
            .store
            .upsert_sensor_config(&sim_config("c2"))
            .await
            .unwrap();
        assert_eq!(supervisor.reload().await.unwrap(), 2);
        assert_eq!(supervisor.adapter_count(), 2);
    }
}
