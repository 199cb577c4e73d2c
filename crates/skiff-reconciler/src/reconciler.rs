use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use skiff_domain::{
    AppId, AppReport, CurrentState, Service, ServiceId, ServiceReport, ServiceStatus, TargetState,
};
use skiff_driver::{
    managed_filter, ContainerDriver, CreateSpec, DriverError, LABEL_APP_ID, LABEL_CONFIG_HASH,
    LABEL_SERVICE_ID,
};
use skiff_store::{DeviceStore, StoredTargetState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::events::{AgentEvent, EventBus};
use crate::plan::{plan_service, Action, ObservedContainer};
use crate::report::{PassSummary, ServiceFailure};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the background pass when nothing triggers one earlier.
    pub interval: Duration,
    /// In-pass retries for a service hitting transient driver errors.
    pub transient_retries: u32,
    pub retry_backoff: Duration,
    /// Grace period passed to the driver's stop.
    pub stop_grace: Duration,
    /// Delay before retrying a pass aborted by a down runtime.
    pub runtime_retry_delay: Duration,
    pub event_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            transient_retries: 3,
            retry_backoff: Duration::from_millis(250),
            stop_grace: Duration::from_secs(10),
            runtime_retry_delay: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// Owns the target state and converges the container runtime onto it.
///
/// `set_target` persists synchronously and returns after persistence; the
/// apply happens in the next pass. Passes are serialized (at most one
/// executing) and triggers coalesce (at most one queued).
pub struct Reconciler {
    store: Arc<dyn DeviceStore>,
    driver: Arc<dyn ContainerDriver>,
    events: EventBus,
    cfg: ReconcilerConfig,
    /// Snapshot published as a whole; readers clone the Arc and never see a
    /// partially updated document.
    target: RwLock<Option<Arc<StoredTargetState>>>,
    paused: AtomicBool,
    /// Live-tunable pass period (`POST /config`).
    interval_ms: AtomicU64,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    /// Reload the persisted target (crash safety: the store is the source of
    /// truth) and build the engine. The caller kicks the initial pass.
    pub async fn new(
        store: Arc<dyn DeviceStore>,
        driver: Arc<dyn ContainerDriver>,
        cfg: ReconcilerConfig,
    ) -> Result<Arc<Self>, ReconcileError> {
        let target = store.load_target_state().await?.map(Arc::new);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let interval_ms = AtomicU64::new(cfg.interval.as_millis() as u64);
        Ok(Arc::new(Self {
            store,
            driver,
            events: EventBus::new(cfg.event_capacity),
            cfg,
            target: RwLock::new(target),
            paused: AtomicBool::new(false),
            interval_ms,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            pass_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn get_target(&self) -> Option<Arc<StoredTargetState>> {
        self.target.read().unwrap().clone()
    }

    /// Validate, persist (hash + version), publish the new snapshot and
    /// schedule a pass. Returns once persisted, not once applied.
    pub async fn set_target(
        &self,
        new_target: TargetState,
    ) -> Result<StoredTargetState, ReconcileError> {
        new_target.validate()?;
        let stored = self.store.save_target_state(&new_target).await?;
        *self.target.write().unwrap() = Some(Arc::new(stored.clone()));
        info!(
            version = stored.version,
            hash = %stored.hash,
            services = stored.target.service_count(),
            "target state updated"
        );
        self.events.publish(AgentEvent::TargetStateChanged {
            version: stored.version,
            hash: stored.hash.clone(),
        });
        self.trigger_reconcile();
        Ok(stored)
    }

    /// Request a pass. Returns false when one is already queued: triggers
    /// coalesce instead of piling up.
    pub fn trigger_reconcile(&self) -> bool {
        self.trigger_tx.try_send(()).is_ok()
    }

    pub fn pause_reconciliation(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("reconciliation paused");
    }

    pub fn resume_reconciliation(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("reconciliation resumed");
        self.trigger_reconcile();
    }

    pub fn is_reconciliation_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Mirror of the target annotated with what the driver actually reports.
    pub async fn current_state(&self) -> Result<CurrentState, ReconcileError> {
        let target = self.target_or_empty();
        let (observed, _) = self.observe().await?;

        let mut current = CurrentState {
            config: target.config.clone(),
            ..Default::default()
        };
        for (app_id, app) in &target.apps {
            let mut services = Vec::with_capacity(app.services.len());
            for svc in &app.services {
                let obs = observed.get(&(*app_id, svc.service_id.clone()));
                let image_digest = match obs {
                    Some(o) => self
                        .driver
                        .inspect(&o.id)
                        .await
                        .ok()
                        .and_then(|d| d.image_digest),
                    None => None,
                };
                services.push(ServiceReport {
                    service_id: svc.service_id.clone(),
                    service_name: svc.service_name.clone(),
                    image_name: svc.image_name.clone(),
                    desired_state: svc.desired_state,
                    status: obs
                        .map(|o| o.state.as_service_status())
                        .unwrap_or(ServiceStatus::Missing),
                    container_id: obs.map(|o| o.id.clone()),
                    image_digest,
                });
            }
            current.apps.insert(
                *app_id,
                AppReport {
                    app_id: *app_id,
                    app_name: app.app_name.clone(),
                    services,
                },
            );
        }
        Ok(current)
    }

    /// The pass loop. Ticks on the configured interval and on coalesced
    /// triggers; exits at the next suspension point after cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut trigger_rx) = self.trigger_rx.lock().unwrap().take() else {
            warn!("reconciler run loop started twice, ignoring");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval()) => {}
                _ = trigger_rx.recv() => {}
            }
            if self.paused.load(Ordering::Relaxed) {
                debug!("reconciliation paused, skipping pass");
                continue;
            }
            match self.reconcile_once().await {
                Ok(summary) if summary.is_partial() => {
                    warn!(
                        changed = summary.changed,
                        failed = summary.failed.len(),
                        "reconcile pass partial"
                    );
                }
                Ok(summary) => {
                    debug!(
                        changed = summary.changed,
                        unchanged = summary.unchanged,
                        removed = summary.removed,
                        "reconcile pass complete"
                    );
                }
                Err(ReconcileError::RuntimeDown(e)) => {
                    warn!(error = %e, "runtime down, pass aborted; retrying after delay");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.cfg.runtime_retry_delay) => {}
                    }
                    self.trigger_reconcile();
                }
                Err(e) => warn!(error = %e, "reconcile pass failed"),
            }
        }
    }

    /// One diff + plan + apply execution. Serialized by an internal lock so
    /// at most one pass runs at any instant.
    pub async fn reconcile_once(&self) -> Result<PassSummary, ReconcileError> {
        let _pass = self.pass_lock.lock().await;
        let target = self.target_or_empty();
        let (mut observed, orphans) = self.observe().await?;
        let mut summary = PassSummary::default();

        // Removals happen before creations to free names and ports.
        let stale: Vec<(AppId, ServiceId)> = observed
            .keys()
            .filter(|(app_id, service_id)| {
                target
                    .apps
                    .get(app_id)
                    .map(|app| !app.services.iter().any(|s| &s.service_id == service_id))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for slot in stale {
            let Some(obs) = observed.remove(&slot) else { continue };
            match self.remove_container(&obs.id).await {
                Ok(()) => {
                    summary.removed += 1;
                    self.events.publish(AgentEvent::ServiceRemoved {
                        app_id: slot.0,
                        service_id: slot.1.clone(),
                    });
                }
                Err(DriverError::RuntimeDown(e)) => return Err(ReconcileError::RuntimeDown(e)),
                Err(e) => {
                    warn!(container = %obs.id, error = %e, "failed to remove stale container");
                    summary.failed.push(ServiceFailure {
                        app_id: slot.0,
                        service_id: slot.1.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        for id in orphans {
            match self.remove_container(&id).await {
                Ok(()) => summary.removed += 1,
                Err(DriverError::RuntimeDown(e)) => return Err(ReconcileError::RuntimeDown(e)),
                Err(e) => warn!(container = %id, error = %e, "failed to remove orphan container"),
            }
        }

        // Apps in ascending numeric id (BTreeMap order), services in
        // declared order. One failing service never aborts the pass.
        for (app_id, app) in &target.apps {
            for svc in &app.services {
                let obs = observed.get(&(*app_id, svc.service_id.clone()));
                let action = plan_service(svc, obs);
                if action == Action::NoOp {
                    summary.unchanged += 1;
                    continue;
                }
                debug!(app_id = %app_id, service_id = %svc.service_id, ?action, "applying");
                match self.apply_with_retries(*app_id, svc, &action).await {
                    Ok(()) => {
                        summary.changed += 1;
                        self.publish_outcome(*app_id, svc, &action);
                    }
                    Err(DriverError::RuntimeDown(e)) => {
                        return Err(ReconcileError::RuntimeDown(e))
                    }
                    Err(e) => {
                        warn!(
                            app_id = %app_id,
                            service_id = %svc.service_id,
                            error = %e,
                            "service reconcile failed"
                        );
                        self.events.publish(AgentEvent::ServiceFailed {
                            app_id: *app_id,
                            service_id: svc.service_id.clone(),
                            error: e.to_string(),
                        });
                        summary.failed.push(ServiceFailure {
                            app_id: *app_id,
                            service_id: svc.service_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        self.events.publish(AgentEvent::ReconcilePassCompleted {
            changed: summary.changed,
            failed: summary.failed.len(),
            partial: summary.is_partial(),
        });
        Ok(summary)
    }

    fn target_or_empty(&self) -> TargetState {
        self.get_target()
            .map(|s| s.target.clone())
            .unwrap_or_default()
    }

    /// Discover managed containers and key them back to service slots.
    /// Containers with unreadable labels, and duplicates for an occupied
    /// slot, are reported as orphans for removal.
    async fn observe(
        &self,
    ) -> Result<(HashMap<(AppId, ServiceId), ObservedContainer>, Vec<String>), ReconcileError>
    {
        let summaries = self
            .driver
            .list_containers(&managed_filter())
            .await
            .map_err(|e| match e {
                DriverError::RuntimeDown(m) => ReconcileError::RuntimeDown(m),
                other => ReconcileError::Driver(other),
            })?;

        let mut observed = HashMap::new();
        let mut orphans = Vec::new();
        for summary in summaries {
            let app_id = summary
                .labels
                .get(LABEL_APP_ID)
                .and_then(|v| v.parse::<u32>().ok());
            let service_id = summary.labels.get(LABEL_SERVICE_ID).cloned();
            match (app_id, service_id) {
                (Some(app_id), Some(service_id)) => {
                    let slot = (AppId(app_id), ServiceId::new(service_id));
                    let obs = ObservedContainer {
                        id: summary.id.clone(),
                        state: summary.state,
                        image: summary.image.clone(),
                        config_hash: summary.labels.get(LABEL_CONFIG_HASH).cloned(),
                    };
                    if observed.contains_key(&slot) {
                        orphans.push(summary.id);
                    } else {
                        observed.insert(slot, obs);
                    }
                }
                _ => orphans.push(summary.id),
            }
        }
        Ok((observed, orphans))
    }

    async fn apply_with_retries(
        &self,
        app_id: AppId,
        svc: &Service,
        action: &Action,
    ) -> Result<(), DriverError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.apply_action(app_id, svc, action).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.cfg.transient_retries => {
                    let backoff = self.cfg.retry_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        service_id = %svc.service_id,
                        attempt,
                        error = %e,
                        "transient driver error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_action(
        &self,
        app_id: AppId,
        svc: &Service,
        action: &Action,
    ) -> Result<(), DriverError> {
        match action {
            Action::NoOp => Ok(()),
            Action::Create { start, pause } => {
                self.create_service(app_id, svc, *start, *pause).await
            }
            Action::Recreate { id, start, pause } => {
                self.stop_if_running(id).await?;
                match self.driver.remove(id, true).await {
                    Ok(()) | Err(DriverError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.create_service(app_id, svc, *start, *pause).await
            }
            Action::Start { id, pause } => {
                self.driver.start(id).await?;
                if *pause {
                    self.driver.pause(id).await?;
                }
                Ok(())
            }
            Action::Unpause { id } => self.driver.unpause(id).await,
            Action::Pause { id } => self.driver.pause(id).await,
            Action::Stop { id } => self.driver.stop(id, self.cfg.stop_grace).await,
            Action::UnpauseThenStop { id } => {
                self.driver.unpause(id).await?;
                self.driver.stop(id, self.cfg.stop_grace).await
            }
        }
    }

    async fn create_service(
        &self,
        app_id: AppId,
        svc: &Service,
        start: bool,
        pause: bool,
    ) -> Result<(), DriverError> {
        self.driver.pull_image(&svc.image_name).await?;
        self.events.publish(AgentEvent::ImagePulled {
            image: svc.image_name.clone(),
        });

        let spec = CreateSpec::for_service(app_id, svc);
        let id = match self.driver.create(&spec).await {
            Ok(id) => id,
            Err(DriverError::Conflict(_)) => {
                // name collision from a previous incomplete pass: force-remove
                // the offender and retry exactly once
                warn!(name = %spec.name, "create conflict, force-removing name holder");
                self.remove_by_name(&spec.name).await?;
                self.driver.create(&spec).await?
            }
            Err(e) => return Err(e),
        };
        if start {
            self.driver.start(&id).await?;
            if pause {
                self.driver.pause(&id).await?;
            }
        }
        Ok(())
    }

    async fn stop_if_running(&self, id: &str) -> Result<(), DriverError> {
        match self.driver.stop(id, self.cfg.stop_grace).await {
            Ok(()) | Err(DriverError::NotFound(_)) => Ok(()),
            // paused containers refuse a plain stop on some runtimes
            Err(DriverError::Conflict(_)) => {
                self.driver.unpause(id).await.ok();
                self.driver.stop(id, self.cfg.stop_grace).await
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), DriverError> {
        self.stop_if_running(id).await?;
        match self.driver.remove(id, true).await {
            Ok(()) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_by_name(&self, name: &str) -> Result<(), DriverError> {
        let all = self.driver.list_containers(&[]).await?;
        if let Some(c) = all.into_iter().find(|c| c.name == name) {
            self.driver.remove(&c.id, true).await
        } else {
            Ok(())
        }
    }

    fn publish_outcome(&self, app_id: AppId, svc: &Service, action: &Action) {
        let service_id = svc.service_id.clone();
        let event = match action {
            Action::NoOp => return,
            Action::Create { start: true, pause: false }
            | Action::Start { pause: false, .. } => {
                AgentEvent::ServiceStarted { app_id, service_id }
            }
            Action::Create { pause: true, .. } | Action::Start { pause: true, .. } => {
                AgentEvent::ServicePaused { app_id, service_id }
            }
            Action::Create { start: false, .. } => return,
            Action::Recreate { .. } => AgentEvent::ServiceRecreated { app_id, service_id },
            Action::Unpause { .. } => AgentEvent::ServiceUnpaused { app_id, service_id },
            Action::Pause { .. } => AgentEvent::ServicePaused { app_id, service_id },
            Action::Stop { .. } | Action::UnpauseThenStop { .. } => {
                AgentEvent::ServiceStopped { app_id, service_id }
            }
        };
        self.events.publish(event);
    }
}
