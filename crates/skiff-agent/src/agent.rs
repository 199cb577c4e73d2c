use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use skiff_adapters::{AdapterRegistry, AdapterSupervisor, RuntimeOptions};
use skiff_api::state::ProvisionDefaults;
use skiff_api::{build_app, AppState};
use skiff_domain::{Identity, Secret};
use skiff_driver::{ContainerDriver, MemoryDriver};
use skiff_http::{CloudClient, CloudClientConfig};
use skiff_log::{LogUploader, LogUploaderConfig, SampleRates};
use skiff_provision::{provision, ProvisionRequest};
use skiff_reconciler::{Reconciler, ReconcilerConfig};
use skiff_store::{DeviceStore, RedbStore};
use skiff_sync::{CloudSync, ConnectionMonitor, SyncConfig, Wakeup};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cli::Cli;
use crate::supervise::TaskSupervisor;
use crate::anomaly;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const PROVISION_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Orchestrates the whole agent. Returns the process exit code:
/// 0 normal shutdown, 1 fatal startup error, 2 unrecoverable runtime error.
pub async fn run(cli: Cli) -> i32 {
    // 1. Logging: local sink now, remote sink armed after provisioning.
    let log = skiff_log::init(&cli.log_level, SampleRates::default(), 4096);
    info!(version = env!("CARGO_PKG_VERSION"), "skiffd starting");

    // 2. Store + migrations. A corrupt store or failed migration is fatal;
    // nothing is ever wiped in response.
    let store: Arc<dyn DeviceStore> = match RedbStore::open(&cli.data_dir.join("device.db")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot open device store");
            return 1;
        }
    };
    match store.run_migrations().await {
        Ok(applied) if !applied.is_empty() => info!(?applied, "migrations applied"),
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "migration failed");
            return 1;
        }
    }

    // 3. Identity / provisioning.
    let mut identity = match store.load_identity().await {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "cannot read identity");
            return 1;
        }
    };

    let provisioned = identity.as_ref().map(|i| i.provisioned).unwrap_or(false);
    if !provisioned && cli.require_provisioning {
        let Some(secret) = cli.provisioning_secret.clone() else {
            error!("REQUIRE_PROVISIONING is set but PROVISIONING_SECRET is missing");
            return 1;
        };
        let Some(endpoint) = cli.cloud_api_endpoint.clone() else {
            error!("REQUIRE_PROVISIONING is set but CLOUD_API_ENDPOINT is missing");
            return 1;
        };
        let request = ProvisionRequest {
            api_endpoint: endpoint,
            provisioning_secret: Secret::new(secret),
            device_name: cli.device_name.clone(),
            device_type: cli.device_type.clone(),
        };
        let mut backoff = Duration::from_secs(1);
        identity = loop {
            match provision(store.clone(), &request).await {
                Ok(identity) => break Some(identity),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, retry_in_s = backoff.as_secs(), "provisioning failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(PROVISION_BACKOFF_CAP);
                }
                Err(e) => {
                    error!(error = %e, "provisioning impossible");
                    return 1;
                }
            }
        };
    }

    // First boot without provisioning still mints a durable uuid.
    let identity = match identity {
        Some(identity) => identity,
        None => {
            let fresh = Identity::unprovisioned(
                Uuid::new_v4(),
                &cli.device_name,
                &cli.device_type,
                cli.cloud_api_endpoint.clone().unwrap_or_default(),
            );
            if let Err(e) = store.save_identity(&fresh).await {
                error!(error = %e, "cannot persist identity");
                return 1;
            }
            fresh
        }
    };
    info!(uuid = %identity.uuid, provisioned = identity.provisioned, "device identity ready");

    // 4. Cloud HTTP client from whatever credentials exist.
    let client_cfg = if identity.api_endpoint.is_empty() {
        // local-only placeholder; the cloud loops are not started
        CloudClientConfig::new("http://127.0.0.1:0")
    } else {
        CloudClientConfig::from_identity(&identity)
    };
    let client = match CloudClient::new(client_cfg) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "cannot build cloud client");
            return 1;
        }
    };

    let (task_supervisor, mut fatal_rx) = TaskSupervisor::new();
    let recon_cancel = CancellationToken::new();
    let sync_cancel = CancellationToken::new();
    let log_cancel = CancellationToken::new();
    let api_cancel = CancellationToken::new();

    // 5. Reconciler, loaded from the persisted target; initial pass queued.
    let driver: Arc<dyn ContainerDriver> = Arc::new(MemoryDriver::new());
    let reconciler = match Reconciler::new(
        store.clone(),
        driver.clone(),
        ReconcilerConfig {
            interval: Duration::from_millis(cli.reconciliation_interval_ms),
            ..Default::default()
        },
    )
    .await
    {
        Ok(reconciler) => reconciler,
        Err(e) => {
            error!(error = %e, "cannot build reconciler");
            return 1;
        }
    };
    reconciler.trigger_reconcile();
    let recon_handle = {
        let reconciler = reconciler.clone();
        task_supervisor.spawn("reconciler", recon_cancel.clone(), move |token| {
            reconciler.clone().run(token)
        })
    };

    let monitor = Arc::new(ConnectionMonitor::new(reconciler.events().clone()));
    let anomaly_handle = {
        let store = store.clone();
        let events = reconciler.events().clone();
        task_supervisor.spawn("anomaly-recorder", recon_cancel.clone(), move |token| {
            anomaly::run(store.clone(), events.subscribe(), token)
        })
    };

    // 6. Cloud sync + remote logging, only with a provisioned identity.
    let wakeup = Wakeup::new();
    let sync = CloudSync::new(
        client.clone(),
        reconciler.clone(),
        monitor.clone(),
        identity.uuid,
        wakeup.clone(),
        SyncConfig {
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            report_interval: Duration::from_millis(cli.report_interval_ms),
            ..Default::default()
        },
    );
    let mut sync_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut log_handles: Vec<JoinHandle<()>> = Vec::new();
    if identity.provisioned {
        {
            let sync = sync.clone();
            sync_handles.push(task_supervisor.spawn(
                "cloud-poll",
                sync_cancel.clone(),
                move |token| sync.clone().run_poll_loop(token),
            ));
        }
        {
            let sync = sync.clone();
            sync_handles.push(task_supervisor.spawn(
                "cloud-report",
                sync_cancel.clone(),
                move |token| sync.clone().run_report_loop(token),
            ));
        }

        log.enable_remote();
        let uploader = Arc::new(LogUploader::new(
            log.ring(),
            client.clone(),
            identity.uuid,
            monitor.subscribe(),
            LogUploaderConfig {
                gzip: cli.log_compression,
                ..Default::default()
            },
        ));
        log_handles.push(task_supervisor.spawn(
            "log-uploader",
            log_cancel.clone(),
            move |token| {
                let uploader = uploader.clone();
                async move { uploader.run(token).await }
            },
        ));

        #[cfg(feature = "mqtt")]
        if let Some(mqtt_config) = identity.mqtt.clone() {
            let wakeup = wakeup.clone();
            let uuid = identity.uuid;
            sync_handles.push(task_supervisor.spawn(
                "mqtt-wake",
                sync_cancel.clone(),
                move |token| {
                    skiff_sync::mqtt::run_wake_listener(
                        mqtt_config.clone(),
                        uuid,
                        wakeup.clone(),
                        token,
                    )
                },
            ));
        }
    } else {
        info!("unprovisioned: cloud sync and remote logging disabled");
    }

    // 7. Protocol adapters.
    let adapter_supervisor = AdapterSupervisor::new(
        store.clone(),
        Arc::new(AdapterRegistry::builtin()),
        cli.data_dir.clone(),
        RuntimeOptions::default(),
    );
    match adapter_supervisor.start().await {
        Ok(count) => info!(adapters = count, "adapter supervisor running"),
        Err(e) => warn!(error = %e, "adapter supervisor failed to start"),
    }

    // 8. Local control API.
    let state = AppState {
        store: store.clone(),
        driver,
        reconciler: reconciler.clone(),
        sync,
        monitor,
        supervisor: adapter_supervisor.clone(),
        log: Some(log.clone()),
        provision_defaults: Arc::new(ProvisionDefaults {
            api_endpoint: cli.cloud_api_endpoint.clone(),
            device_name: cli.device_name.clone(),
            device_type: cli.device_type.clone(),
        }),
    };
    let addr = SocketAddr::new(cli.device_api_bind, cli.device_api_port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "cannot bind control API");
            return 1;
        }
    };
    info!(%addr, "control API listening");
    let api_handle = {
        let app = build_app(state);
        let token = api_cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "control API server error");
            }
        })
    };

    // 9. Run until a signal or a fatal escalation.
    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            0
        }
        reason = fatal_rx.recv() => {
            error!(reason = reason.as_deref().unwrap_or("unknown"), "unrecoverable runtime error");
            2
        }
    };

    // 10. Stop in reverse start order with bounded grace.
    api_cancel.cancel();
    drain("control-api", vec![api_handle]).await;
    adapter_supervisor.stop().await;
    sync_cancel.cancel();
    drain("cloud-sync", sync_handles).await;
    recon_cancel.cancel();
    drain("reconciler", vec![recon_handle, anomaly_handle]).await;
    // final log flush happens inside the uploader's cancel path
    log_cancel.cancel();
    drain("log-uploader", log_handles).await;

    info!("skiffd stopped");
    exit_code
}

async fn drain(group: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!(group, "shutdown grace elapsed, abandoning task");
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
