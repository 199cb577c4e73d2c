use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use skiff_domain::{Sample, SensorOutput, WireFormat};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AdapterError;

/// Render one sample in the protocol's configured wire format, with the
/// record delimiter appended.
pub fn format_record(output: &SensorOutput, sample: &Sample) -> Vec<u8> {
    let mut bytes = match output.format {
        WireFormat::Json => {
            let mut value = serde_json::to_value(sample).unwrap_or(serde_json::Value::Null);
            if let Some(obj) = value.as_object_mut() {
                if !output.include_timestamp {
                    obj.remove("timestamp");
                }
                if !output.include_device_name {
                    obj.remove("device_name");
                }
            }
            serde_json::to_vec(&value).unwrap_or_default()
        }
        WireFormat::Csv => {
            let mut fields: Vec<String> = Vec::with_capacity(6);
            if output.include_device_name {
                fields.push(sample.device_name.clone());
            }
            fields.push(sample.register_name.clone());
            fields.push(sample.value.map(|v| v.to_string()).unwrap_or_default());
            fields.push(sample.unit.clone().unwrap_or_default());
            if output.include_timestamp {
                fields.push(sample.timestamp.to_rfc3339());
            }
            fields.push(sample.quality.to_string());
            fields.join(",").into_bytes()
        }
    };
    bytes.extend_from_slice(output.delimiter.as_bytes());
    bytes
}

/// Sending side handed to adapter runtimes. Bounded; overflow drops the
/// sample and counts it rather than stalling acquisition.
#[derive(Clone)]
pub struct OutputHandle {
    tx: mpsc::Sender<Sample>,
    dropped: Arc<AtomicU64>,
}

impl OutputHandle {
    /// Handle wired to a plain channel instead of a socket; the receiving
    /// side sees exactly what would be written. Used by adapter tests.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn send(&self, sample: Sample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Listens on the protocol's unix-domain socket and fans every record out to
/// all connected clients. Clients that stop reading are dropped on the next
/// failed write.
pub struct OutputWriter;

impl OutputWriter {
    /// Returns the sending handle and the writer task; the caller awaits the
    /// task on shutdown so the socket file is unlinked before any rebind.
    pub fn spawn(
        output: SensorOutput,
        cancel: CancellationToken,
    ) -> Result<(OutputHandle, tokio::task::JoinHandle<()>), AdapterError> {
        if let Some(parent) = output.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::Config(format!("socket dir: {e}")))?;
        }
        // a stale socket file from a previous run blocks bind
        let _ = std::fs::remove_file(&output.socket_path);
        let listener = UnixListener::bind(&output.socket_path).map_err(|e| {
            AdapterError::Config(format!(
                "bind {}: {e}",
                output.socket_path.display()
            ))
        })?;
        debug!(path = %output.socket_path.display(), protocol = %output.protocol, "sensor output socket ready");

        let (tx, mut rx) = mpsc::channel::<Sample>(256);
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(async move {
            let mut clients: Vec<UnixStream> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => clients.push(stream),
                            Err(e) => warn!(error = %e, "sensor socket accept failed"),
                        }
                    }
                    sample = rx.recv() => {
                        let Some(sample) = sample else { break };
                        let record = format_record(&output, &sample);
                        let mut alive = Vec::with_capacity(clients.len());
                        for mut client in clients.drain(..) {
                            if client.write_all(&record).await.is_ok() {
                                alive.push(client);
                            }
                        }
                        clients = alive;
                    }
                }
            }
            let _ = std::fs::remove_file(&output.socket_path);
        });

        Ok((OutputHandle { tx, dropped }, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skiff_domain::Quality;
    use tokio::io::AsyncBufReadExt;

    fn sample() -> Sample {
        Sample {
            device_name: "plc-7".into(),
            register_name: "temp".into(),
            value: Some(21.5),
            unit: Some("C".into()),
            timestamp: Utc::now(),
            quality: Quality::Good,
            quality_code: None,
        }
    }

    fn output(format: WireFormat) -> SensorOutput {
        serde_json::from_value(serde_json::json!({
            "protocol": "sim",
            "socket_path": "/tmp/unused.sock",
            "format": format,
        }))
        .unwrap()
    }

    #[test]
    fn json_record_honours_flags() {
        let mut out = output(WireFormat::Json);
        out.include_timestamp = false;
        out.include_device_name = false;
        let bytes = format_record(&out, &sample());
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert!(value.get("timestamp").is_none());
        assert!(value.get("device_name").is_none());
        assert_eq!(value["register_name"], "temp");
        assert_eq!(value["quality"], "GOOD");
    }

    #[test]
    fn csv_record_with_null_value() {
        let out = output(WireFormat::Csv);
        let mut s = sample();
        s.value = None;
        s.quality = Quality::Bad;
        let text = String::from_utf8(format_record(&out, &s)).unwrap();
        let line = text.trim_end();
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[0], "plc-7");
        assert_eq!(fields[1], "temp");
        assert_eq!(fields[2], "", "null value renders empty");
        assert_eq!(fields.last().copied(), Some("BAD"));
    }

    #[tokio::test]
    async fn socket_fans_out_records_to_clients() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut out = output(WireFormat::Json);
        out.socket_path = dir.path().join("sim.sock");

        let cancel = CancellationToken::new();
        let (handle, task) = OutputWriter::spawn(out.clone(), cancel.clone()).unwrap();

        let client = UnixStream::connect(&out.socket_path).await.unwrap();
        let mut reader = tokio::io::BufReader::new(client);
        // give the accept branch a turn
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.send(sample());
        let mut line = String::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            reader.read_line(&mut line),
        )
        .await
        .expect("record should arrive")
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["register_name"], "temp");

        cancel.cancel();
        task.await.unwrap();
        assert!(!out.socket_path.exists(), "socket file unlinked on shutdown");
    }
}
