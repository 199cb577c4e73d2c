use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use skiff_domain::ConnectionHealth;
use skiff_http::CloudClient;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ring::LogRing;

#[derive(Debug, Clone)]
pub struct LogUploaderConfig {
    pub upload_interval: Duration,
    /// Flush early once the ring holds at least this many records.
    pub watermark: usize,
    pub gzip: bool,
}

impl Default for LogUploaderConfig {
    fn default() -> Self {
        Self {
            upload_interval: Duration::from_secs(30),
            watermark: 3_072,
            gzip: true,
        }
    }
}

/// Drains the log ring to `POST /device/{uuid}/logs` as NDJSON. Uploads are
/// deferred while the connection monitor reports `offline`; a failed upload
/// puts the batch back at the head of the ring.
pub struct LogUploader {
    ring: Arc<LogRing>,
    client: Arc<CloudClient>,
    device_uuid: Uuid,
    health: watch::Receiver<ConnectionHealth>,
    cfg: LogUploaderConfig,
}

impl LogUploader {
    pub fn new(
        ring: Arc<LogRing>,
        client: Arc<CloudClient>,
        device_uuid: Uuid,
        health: watch::Receiver<ConnectionHealth>,
        cfg: LogUploaderConfig,
    ) -> Self {
        Self {
            ring,
            client,
            device_uuid,
            health,
            cfg,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut flush_tick = tokio::time::interval(self.cfg.upload_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut watermark_tick = tokio::time::interval(Duration::from_millis(500));
        watermark_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick of an interval fires immediately
        flush_tick.tick().await;
        watermark_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // last chance flush, ignoring the offline deferral
                    self.flush(true).await;
                    return;
                }
                _ = flush_tick.tick() => {
                    self.flush(false).await;
                }
                _ = watermark_tick.tick() => {
                    if self.ring.len() >= self.cfg.watermark {
                        self.flush(false).await;
                    }
                }
            }
        }
    }

    pub async fn flush(&self, force: bool) {
        if !force && *self.health.borrow() == ConnectionHealth::Offline {
            debug!("connection offline, deferring log upload");
            return;
        }
        let batch = self.ring.drain();
        if batch.is_empty() {
            return;
        }

        let mut ndjson = Vec::with_capacity(batch.len() * 128);
        for record in &batch {
            match serde_json::to_vec(record) {
                Ok(line) => {
                    ndjson.extend_from_slice(&line);
                    ndjson.push(b'\n');
                }
                Err(e) => warn!(error = %e, "unserializable log record skipped"),
            }
        }

        let body = if self.cfg.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            if encoder.write_all(&ndjson).is_err() {
                warn!("gzip of log batch failed, sending uncompressed");
                ndjson.clone()
            } else {
                match encoder.finish() {
                    Ok(compressed) => compressed,
                    Err(e) => {
                        warn!(error = %e, "gzip finish failed, sending uncompressed");
                        ndjson.clone()
                    }
                }
            }
        } else {
            ndjson.clone()
        };

        let path = format!("/device/{}/logs", self.device_uuid);
        match self.client.post_ndjson(&path, body, self.cfg.gzip).await {
            Ok(resp) if resp.is_success() => {
                debug!(records = batch.len(), "log batch uploaded");
            }
            Ok(resp) => {
                warn!(status = resp.status, records = batch.len(), "log upload rejected");
                self.ring.requeue_front(batch);
            }
            Err(e) => {
                warn!(error = %e, records = batch.len(), "log upload failed");
                self.ring.requeue_front(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::record::{LogLevel, LogRecord};
    use chrono::Utc;
    use skiff_http::CloudClientConfig;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(msg: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: LogLevel::Error,
            component: Component::CloudSync,
            message: msg.to_string(),
            fields: BTreeMap::new(),
            sampled: false,
        }
    }

    fn uploader_for(
        server: &MockServer,
        ring: Arc<LogRing>,
        health: watch::Receiver<ConnectionHealth>,
        gzip: bool,
    ) -> LogUploader {
        let client = CloudClient::new(CloudClientConfig::new(server.uri())).unwrap();
        LogUploader::new(
            ring,
            Arc::new(client),
            Uuid::nil(),
            health,
            LogUploaderConfig {
                gzip,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn flush_posts_ndjson() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/device/{}/logs", Uuid::nil())))
            .and(header("Content-Type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ring = Arc::new(LogRing::new(16));
        ring.push(record("a"));
        ring.push(record("b"));
        let (_tx, rx) = watch::channel(ConnectionHealth::Online);

        uploader_for(&server, ring.clone(), rx, false).flush(false).await;
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn failed_upload_requeues_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ring = Arc::new(LogRing::new(16));
        ring.push(record("keep-me"));
        let (_tx, rx) = watch::channel(ConnectionHealth::Online);

        uploader_for(&server, ring.clone(), rx, false).flush(false).await;
        assert_eq!(ring.len(), 1, "failed batch must be requeued");
    }

    #[tokio::test]
    async fn offline_defers_upload() {
        let server = MockServer::start().await;
        // no mock mounted: a request would 404 and drain the ring

        let ring = Arc::new(LogRing::new(16));
        ring.push(record("held"));
        let (_tx, rx) = watch::channel(ConnectionHealth::Offline);

        uploader_for(&server, ring.clone(), rx, false).flush(false).await;
        assert_eq!(ring.len(), 1, "offline flush must not drain the ring");
    }
}
