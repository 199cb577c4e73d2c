use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skiff_http::CloudClient;
use skiff_reconciler::Reconciler;
use skiff_store::canonical_hash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::metrics::MetricsSampler;
use crate::monitor::ConnectionMonitor;
use crate::wakeup::Wakeup;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// A report is sent at least this often even when nothing changed.
    pub force_report_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(10),
            force_report_interval: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 304: entity tag matched, nothing fetched.
    NotModified,
    /// 200 with a document hashing equal to the local target.
    Unchanged,
    /// 200 with new content; the reconciler took it.
    Updated { version: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent,
    /// State hash unchanged and the force interval has not elapsed.
    Skipped,
}

/// The two cloud loops: pull target state, push current state + metrics.
/// Independent cadences, shared connection monitor.
pub struct CloudSync {
    client: Arc<CloudClient>,
    reconciler: Arc<Reconciler>,
    monitor: Arc<ConnectionMonitor>,
    sampler: MetricsSampler,
    device_uuid: Uuid,
    wakeup: Wakeup,
    cfg: Mutex<SyncConfig>,
    last_etag: Mutex<Option<String>>,
    last_report: Mutex<Option<(String, Instant)>>,
}

impl CloudSync {
    pub fn new(
        client: Arc<CloudClient>,
        reconciler: Arc<Reconciler>,
        monitor: Arc<ConnectionMonitor>,
        device_uuid: Uuid,
        wakeup: Wakeup,
        cfg: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            reconciler,
            monitor,
            sampler: MetricsSampler::new(),
            device_uuid,
            wakeup,
            cfg: Mutex::new(cfg),
            last_etag: Mutex::new(None),
            last_report: Mutex::new(None),
        })
    }

    pub fn wakeup(&self) -> Wakeup {
        self.wakeup.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.cfg.lock().unwrap().poll_interval
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.cfg.lock().unwrap().poll_interval = interval;
    }

    pub fn report_interval(&self) -> Duration {
        self.cfg.lock().unwrap().report_interval
    }

    pub fn set_report_interval(&self, interval: Duration) {
        self.cfg.lock().unwrap().report_interval = interval;
    }

    /// Poll loop: If-None-Match polling with exponential backoff on
    /// transient failures (1 s → 60 s) and wake-up coalescing.
    pub async fn run_poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let (backoff_base, backoff_cap) = {
            let cfg = self.cfg.lock().unwrap();
            (cfg.backoff_base, cfg.backoff_cap)
        };
        let mut backoff = backoff_base;
        loop {
            let delay = match self.poll_once().await {
                Ok(outcome) => {
                    debug!(?outcome, "poll complete");
                    backoff = backoff_base;
                    self.poll_interval()
                }
                Err(SyncError::Transient(e)) => {
                    warn!(error = %e, next_retry_s = backoff.as_secs(), "poll failed");
                    let delay = backoff;
                    backoff = (backoff * 2).min(backoff_cap);
                    delay
                }
                Err(e) => {
                    warn!(error = %e, "poll rejected");
                    self.poll_interval()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wakeup.wait() => {
                    debug!("woken for immediate poll");
                }
            }
        }
    }

    /// Report loop: fixed cadence, diff-aware.
    pub async fn run_report_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            match self.report_once().await {
                Ok(ReportOutcome::Sent) => debug!("state report sent"),
                Ok(ReportOutcome::Skipped) => debug!("state report skipped, no change"),
                Err(e) => warn!(error = %e, "state report failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.report_interval()) => {}
            }
        }
    }

    pub async fn poll_once(&self) -> Result<PollOutcome, SyncError> {
        let path = format!("/device/{}/state", self.device_uuid);
        let last_etag = self.last_etag.lock().unwrap().clone();

        let resp = match self.client.get_with_etag(&path, last_etag.as_deref()).await {
            Ok(resp) => resp,
            Err(e) => {
                let err = SyncError::from(e);
                if matches!(err, SyncError::Transient(_)) {
                    self.monitor.record_failure();
                }
                return Err(err);
            }
        };

        match resp.status {
            304 => {
                self.monitor.record_success();
                Ok(PollOutcome::NotModified)
            }
            200 => {
                self.monitor.record_success();
                let document = match serde_json::from_slice(&resp.body) {
                    Ok(doc) => doc,
                    Err(e) => {
                        // Discard the document, retain the previous target.
                        return Err(SyncError::Protocol(format!("bad target document: {e}")));
                    }
                };
                let incoming_hash = canonical_hash(&document);
                let local_hash = self.reconciler.get_target().map(|s| s.hash.clone());

                let outcome = if local_hash.as_deref() == Some(incoming_hash.as_str()) {
                    debug!("target content unchanged, updating entity tag only");
                    PollOutcome::Unchanged
                } else {
                    let stored = self
                        .reconciler
                        .set_target(document)
                        .await
                        .map_err(|e| SyncError::Protocol(e.to_string()))?;
                    info!(version = stored.version, "new target state accepted from cloud");
                    PollOutcome::Updated {
                        version: stored.version,
                    }
                };
                *self.last_etag.lock().unwrap() = resp.etag;
                Ok(outcome)
            }
            status if (400..500).contains(&status) => {
                self.monitor.record_success();
                Err(SyncError::Permanent(status))
            }
            status => {
                self.monitor.record_failure();
                Err(SyncError::Transient(format!("cloud returned {status}")))
            }
        }
    }

    pub async fn report_once(&self) -> Result<ReportOutcome, SyncError> {
        let current = self
            .reconciler
            .current_state()
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        // Metrics churn every sample; the skip hash covers only the state
        // mirror so an idle device stays quiet between force reports.
        let state_hash = canonical_hash(&current);
        {
            let last = self.last_report.lock().unwrap();
            if let Some((hash, at)) = last.as_ref() {
                if *hash == state_hash
                    && at.elapsed() < self.cfg.lock().unwrap().force_report_interval
                {
                    return Ok(ReportOutcome::Skipped);
                }
            }
        }

        let mut device = serde_json::to_value(&current)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        let metrics = serde_json::to_value(self.sampler.sample())
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        if let (Some(obj), Some(extra)) = (device.as_object_mut(), metrics.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let payload = serde_json::json!({ self.device_uuid.to_string(): device });

        let resp = match self.client.patch_json("/device/state", &payload).await {
            Ok(resp) => resp,
            Err(e) => {
                let err = SyncError::from(e);
                if matches!(err, SyncError::Transient(_)) {
                    self.monitor.record_failure();
                }
                return Err(err);
            }
        };
        match resp.status {
            status if (200..300).contains(&status) => {
                self.monitor.record_success();
                *self.last_report.lock().unwrap() = Some((state_hash, Instant::now()));
                Ok(ReportOutcome::Sent)
            }
            status if (400..500).contains(&status) => {
                self.monitor.record_success();
                Err(SyncError::Permanent(status))
            }
            status => {
                self.monitor.record_failure();
                Err(SyncError::Transient(format!("cloud returned {status}")))
            }
        }
    }
}
