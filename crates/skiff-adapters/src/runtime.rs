use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use skiff_domain::{DataPoint, Quality, Sample, SensorConfig};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::health::{AdapterHealth, ConnectionState};
use crate::output::OutputHandle;
use crate::session::{ProtocolAdapter, ProtocolSession};

type SharedSession = Mutex<Box<dyn ProtocolSession>>;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Consecutive connect failures before the adapter parks in `Error`.
    pub failure_ceiling: u32,
    /// Transient read retries within one polling tick.
    pub read_retries: u32,
    pub read_retry_backoff: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(60),
            failure_ceiling: 10,
            read_retries: 2,
            read_retry_backoff: Duration::from_millis(100),
        }
    }
}

/// One adapter instance: owns the connection state machine for a single
/// sensor endpoint and emits samples to the protocol's output.
///
/// All session I/O funnels through one FIFO mutex, so endpoints that do not
/// tolerate concurrent requests see strictly serialized traffic.
pub struct AdapterRuntime {
    config: SensorConfig,
    adapter: Arc<dyn ProtocolAdapter>,
    output: OutputHandle,
    health: Arc<RwLock<AdapterHealth>>,
    opts: RuntimeOptions,
}

impl AdapterRuntime {
    pub fn new(
        config: SensorConfig,
        adapter: Arc<dyn ProtocolAdapter>,
        output: OutputHandle,
        opts: RuntimeOptions,
    ) -> Self {
        let health = Arc::new(RwLock::new(AdapterHealth::new(config.enabled)));
        Self {
            config,
            adapter,
            output,
            health,
            opts,
        }
    }

    pub fn health(&self) -> Arc<RwLock<AdapterHealth>> {
        self.health.clone()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = self.opts.reconnect_base;
        let mut consecutive_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            let session = match self.adapter.connect(&self.config).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        config_id = %self.config.config_id,
                        error = %e,
                        "adapter connect failed"
                    );
                    self.health.write().unwrap().record_error(&e.to_string());
                    consecutive_failures += 1;
                    if consecutive_failures >= self.opts.failure_ceiling {
                        warn!(
                            config_id = %self.config.config_id,
                            failures = consecutive_failures,
                            "failure ceiling reached, adapter parked"
                        );
                        self.set_state(ConnectionState::Error);
                        cancel.cancelled().await;
                        return;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.opts.reconnect_cap);
                    continue;
                }
            };
            consecutive_failures = 0;
            backoff = self.opts.reconnect_base;
            let session: SharedSession = Mutex::new(session);

            // Node validation: each configured point probed once; failures
            // mark the point invalid for this session, the rest is cached.
            let mut valid_points = Vec::new();
            for point in &self.config.data_points {
                let result = {
                    let mut guard = session.lock().await;
                    guard.probe(point).await
                };
                match result {
                    Ok(()) => valid_points.push(point.clone()),
                    Err(e) => {
                        warn!(
                            config_id = %self.config.config_id,
                            point = %point.name,
                            error = %e,
                            "data point failed validation, skipping for session"
                        );
                        self.health.write().unwrap().record_error(&e.to_string());
                    }
                }
            }
            self.set_state(ConnectionState::Validated);

            if valid_points.is_empty() {
                warn!(config_id = %self.config.config_id, "no valid data points");
                session.lock().await.close().await;
                self.set_state(ConnectionState::Disconnected);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.opts.reconnect_cap);
                continue;
            }

            info!(
                config_id = %self.config.config_id,
                points = valid_points.len(),
                mode = ?self.config.mode,
                "adapter active"
            );
            self.set_state(ConnectionState::Active);

            match self.config.mode {
                skiff_domain::AcquisitionMode::Poll => {
                    self.poll_session(&session, &valid_points, &cancel).await;
                }
                skiff_domain::AcquisitionMode::Subscription => {
                    let supported = { session.lock().await.supports_subscription() };
                    if supported {
                        self.subscribe_session(&session, &valid_points, &cancel).await;
                    } else {
                        warn!(
                            config_id = %self.config.config_id,
                            "subscription unsupported, falling back to polling"
                        );
                        self.poll_session(&session, &valid_points, &cancel).await;
                    }
                }
            }

            session.lock().await.close().await;
            self.set_state(ConnectionState::Disconnected);
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.opts.reconnect_base) => {}
            }
        }
    }

    /// Client-initiated acquisition on the configured interval. Returns when
    /// the session drops or on cancellation.
    async fn poll_session(
        &self,
        session: &SharedSession,
        points: &[DataPoint],
        cancel: &CancellationToken,
    ) {
        let period = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let started = Instant::now();
            let mut tick_fully_succeeded = true;
            for point in points {
                match self.read_with_retries(session, point).await {
                    Ok(raw) => self.emit_good(point, raw),
                    Err(e) if e.is_connection_loss() => {
                        warn!(
                            config_id = %self.config.config_id,
                            error = %e,
                            "session lost mid-poll"
                        );
                        self.health.write().unwrap().record_error(&e.to_string());
                        return;
                    }
                    Err(e) => {
                        debug!(
                            config_id = %self.config.config_id,
                            point = %point.name,
                            error = %e,
                            "read failed after retries"
                        );
                        tick_fully_succeeded = false;
                        self.health.write().unwrap().record_error(&e.to_string());
                        self.emit_bad(point, &e);
                    }
                }
            }
            self.health
                .write()
                .unwrap()
                .record_poll(tick_fully_succeeded, started.elapsed().as_millis() as u64);
        }
    }

    /// Server-push acquisition: the session holds the mutex for its whole
    /// life and delivers samples through a channel.
    async fn subscribe_session(
        &self,
        session: &SharedSession,
        points: &[DataPoint],
        cancel: &CancellationToken,
    ) {
        let point_map: HashMap<&str, &DataPoint> =
            points.iter().map(|p| (p.name.as_str(), p)).collect();
        let (tx, mut rx) = mpsc::channel::<(String, f64)>(64);
        let sub_cancel = cancel.child_token();

        let subscription = async {
            let mut guard = session.lock().await;
            guard.subscribe(points, tx, sub_cancel.clone()).await
        };
        let consume = async {
            let mut count = 0u64;
            while let Some((name, raw)) = rx.recv().await {
                if let Some(point) = point_map.get(name.as_str()) {
                    self.emit_good(point, raw);
                    count += 1;
                }
            }
            count
        };

        let (result, delivered) = tokio::join!(subscription, consume);
        if let Err(e) = result {
            warn!(config_id = %self.config.config_id, error = %e, "subscription ended");
            self.health.write().unwrap().record_error(&e.to_string());
        }
        debug!(config_id = %self.config.config_id, delivered, "subscription closed");
    }

    async fn read_with_retries(
        &self,
        session: &SharedSession,
        point: &DataPoint,
    ) -> Result<f64, AdapterError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = {
                let mut guard = session.lock().await;
                guard.read(point).await
            };
            match result {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transient() && attempt <= self.opts.read_retries => {
                    tokio::time::sleep(self.opts.read_retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn emit_good(&self, point: &DataPoint, raw: f64) {
        self.health.write().unwrap().record_sample();
        self.output.send(Sample {
            device_name: self.config.name.clone(),
            register_name: point.name.clone(),
            value: Some(raw * point.scale.unwrap_or(1.0)),
            unit: point.unit.clone(),
            timestamp: Utc::now(),
            quality: Quality::Good,
            quality_code: None,
        });
    }

    fn emit_bad(&self, point: &DataPoint, error: &AdapterError) {
        self.output.send(Sample {
            device_name: self.config.name.clone(),
            register_name: point.name.clone(),
            value: None,
            unit: point.unit.clone(),
            timestamp: Utc::now(),
            quality: Quality::Bad,
            quality_code: error.quality_code(),
        });
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(config_id = %self.config.config_id, ?state, "adapter state");
        self.health.write().unwrap().set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CommunicationQuality;
    use crate::sim::SimAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(points: serde_json::Value, extra: serde_json::Value) -> SensorConfig {
        let mut doc = serde_json::json!({
            "config_id": "c1",
            "name": "rig",
            "protocol": "sim",
            "poll_interval_ms": 10,
            "data_points": points,
        });
        if let (Some(obj), Some(add)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in add {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(doc).unwrap()
    }

    fn quick_opts() -> RuntimeOptions {
        RuntimeOptions {
            reconnect_base: Duration::from_millis(5),
            reconnect_cap: Duration::from_millis(50),
            read_retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    async fn collect(
        rx: &mut mpsc::Receiver<Sample>,
        n: usize,
        budget: Duration,
    ) -> Vec<Sample> {
        let mut samples = Vec::new();
        let deadline = tokio::time::Instant::now() + budget;
        while samples.len() < n {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(sample)) => samples.push(sample),
                _ => break,
            }
        }
        samples
    }

    #[tokio::test]
    async fn polls_and_scales_samples() {
        let points = serde_json::json!([
            {"name": "temp", "address": "const:21.5", "unit": "C", "scale": 10.0}
        ]);
        let cfg = config(points, serde_json::json!({}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let health = runtime.health();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 3, Duration::from_secs(2)).await;
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].value, Some(215.0));
        assert_eq!(samples[0].quality, Quality::Good);
        assert_eq!(samples[0].device_name, "rig");
        assert_eq!(samples[0].unit.as_deref(), Some("C"));
        assert_eq!(
            health.read().unwrap().communication_quality,
            CommunicationQuality::Good
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_points_are_skipped_for_the_session() {
        let points = serde_json::json!([
            {"name": "good", "address": "const:1"},
            {"name": "broken", "address": "nonsense"}
        ]);
        let cfg = config(points, serde_json::json!({}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 4, Duration::from_millis(300)).await;
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.register_name == "good"));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_with_backoff_after_connect_failures() {
        let points = serde_json::json!([{"name": "v", "address": "const:1"}]);
        let cfg = config(points, serde_json::json!({"connection": {"fail_connects": 2}}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let health = runtime.health();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 1, Duration::from_secs(2)).await;
        assert_eq!(samples.len(), 1, "adapter must recover after failed connects");
        assert!(health.read().unwrap().error_count >= 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failure_ceiling_parks_the_adapter_in_error() {
        let points = serde_json::json!([{"name": "v", "address": "const:1"}]);
        let cfg = config(points, serde_json::json!({"connection": {"fail_connects": 1000}}));
        let (output, _rx) = OutputHandle::channel(64);
        let mut opts = quick_opts();
        opts.failure_ceiling = 3;
        let runtime = AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, opts);
        let health = runtime.health();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if health.read().unwrap().state == ConnectionState::Error {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("adapter should park in error state");
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transient_reads_are_retried_within_the_tick() {
        // flaky alternates ok/err; with retries every tick succeeds
        let points = serde_json::json!([{"name": "v", "address": "flaky:7"}]);
        let cfg = config(points, serde_json::json!({}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 5, Duration::from_secs(2)).await;
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| s.quality == Quality::Good));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_emit_bad_with_quality_code() {
        let points = serde_json::json!([{"name": "v", "address": "bad"}]);
        let cfg = config(points, serde_json::json!({}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 2, Duration::from_secs(2)).await;
        assert!(!samples.is_empty());
        assert_eq!(samples[0].quality, Quality::Bad);
        assert_eq!(samples[0].value, None);
        assert_eq!(samples[0].quality_code, Some(4));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn subscription_mode_delivers_pushed_samples() {
        let points = serde_json::json!([{"name": "v", "address": "counter"}]);
        let cfg = config(points, serde_json::json!({"mode": "subscription"}));
        let (output, mut rx) = OutputHandle::channel(64);
        let runtime =
            AdapterRuntime::new(cfg, Arc::new(SimAdapter::new()), output, quick_opts());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        let samples = collect(&mut rx, 3, Duration::from_secs(2)).await;
        assert_eq!(samples.len(), 3);
        let values: Vec<f64> = samples.iter().map(|s| s.value.unwrap()).collect();
        assert!(values.windows(2).all(|w| w[1] > w[0]), "pushed values increase");
        cancel.cancel();
        task.await.unwrap();
    }

    // A session that panics if two requests ever overlap.
    struct StrictSession {
        in_flight: Arc<AtomicBool>,
        order: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl ProtocolSession for StrictSession {
        async fn probe(&mut self, _point: &DataPoint) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn read(&mut self, point: &DataPoint) -> Result<f64, AdapterError> {
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "overlapping session requests"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.store(false, Ordering::SeqCst);
            let n: u64 = point.address.parse().unwrap_or(0);
            self.order.lock().unwrap().push(n);
            Ok(n as f64)
        }
    }

    #[tokio::test]
    async fn session_requests_are_strictly_serialized() {
        let in_flight = Arc::new(AtomicBool::new(false));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let session: SharedSession = Mutex::new(Box::new(StrictSession {
            in_flight,
            order: order.clone(),
        }));
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for n in 0..10u64 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let point: DataPoint = serde_json::from_value(serde_json::json!({
                    "name": format!("p{n}"),
                    "address": n.to_string(),
                }))
                .unwrap();
                let mut guard = session.lock().await;
                guard.read(&point).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // FIFO mutex: completion order equals submission order
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }
}
